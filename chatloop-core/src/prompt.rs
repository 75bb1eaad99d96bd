//! Chat prompt templates
//!
//! Each family was trained on one exact turn format, including the full-width
//! colons of ChatGLM2 and the reserved role tokens of Baichuan2. The builders
//! are plain string formatting and never touch the model.

use serde::{Deserialize, Serialize};

/// Default system prompt Qwen substitutes for an empty one
pub const QWEN_DEFAULT_SYSTEM: &str = "You are a helpful assistant.";

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

const BAICHUAN_USER: &str = "<reserved_106>";
const BAICHUAN_ASSISTANT: &str = "<reserved_107>";

/// Chat template of a model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromptTemplate {
    /// `[Round n]` blocks with 问/答 labels
    ChatGlm2,
    /// ChatML with `<|im_start|>` / `<|im_end|>` markers
    ChatMl,
    /// `<reserved_106>` user / `<reserved_107>` assistant tokens
    Baichuan2,
    /// `<|User|>` / `<|Bot|>` with `<eoh>` / `<eoa>` end-of-turn markers
    InternLm,
}

impl PromptTemplate {
    /// Build the full prompt for `query` following `history`.
    pub fn build(&self, history: &[(String, String)], query: &str, system: &str) -> String {
        match self {
            PromptTemplate::ChatGlm2 => build_chatglm2(history, query, system),
            PromptTemplate::ChatMl => build_chatml(history, query, system),
            PromptTemplate::Baichuan2 => build_baichuan2(history, query, system),
            PromptTemplate::InternLm => build_internlm(history, query),
        }
    }
}

fn build_chatglm2(history: &[(String, String)], query: &str, system: &str) -> String {
    let mut prompt = format!("{system}\n\n");
    for (i, (old_query, response)) in history.iter().enumerate() {
        prompt.push_str(&format!(
            "[Round {}]\n\n问：{}\n\n答：{}\n\n",
            i + 1,
            old_query,
            response
        ));
    }
    prompt.push_str(&format!("[Round {}]\n\n问：{}\n\n答：", history.len() + 1, query));
    prompt
}

fn build_chatml(history: &[(String, String)], query: &str, system: &str) -> String {
    let system = if system.is_empty() { QWEN_DEFAULT_SYSTEM } else { system };
    let mut prompt = format!("{IM_START}system\n{system}{IM_END}");
    for (old_query, response) in history {
        prompt.push_str(&format!(
            "\n{IM_START}user\n{old_query}{IM_END}\n{IM_START}assistant\n{response}{IM_END}"
        ));
    }
    prompt.push_str(&format!(
        "\n{IM_START}user\n{query}{IM_END}\n{IM_START}assistant\n"
    ));
    prompt
}

fn build_baichuan2(history: &[(String, String)], query: &str, system: &str) -> String {
    let mut prompt = system.to_string();
    for (old_query, response) in history {
        prompt.push_str(BAICHUAN_USER);
        prompt.push_str(old_query);
        prompt.push_str(BAICHUAN_ASSISTANT);
        prompt.push_str(response);
    }
    prompt.push_str(BAICHUAN_USER);
    prompt.push_str(query);
    prompt.push_str(BAICHUAN_ASSISTANT);
    prompt
}

// InternLM has no system slot in its chat format.
fn build_internlm(history: &[(String, String)], query: &str) -> String {
    let mut prompt = String::new();
    for (old_query, response) in history {
        prompt.push_str(&format!(
            "<s><|User|>:{old_query}<eoh>\n<|Bot|>:{response}<eoa>\n"
        ));
    }
    if prompt.is_empty() {
        prompt.push_str("<s>");
    }
    prompt.push_str(&format!("<|User|>:{query}<eoh>\n<|Bot|>:"));
    prompt
}
