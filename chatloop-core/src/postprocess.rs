//! Response post-processing
//!
//! Half-width punctuation touching a CJK ideograph becomes full-width, and the
//! training-time placeholder is replaced. Both rewrites produce characters the
//! rules never match again, so the function is idempotent.

const TRAINING_TIME_PLACEHOLDER: &str = "[[训练时间]]";
const TRAINING_TIME: &str = "2023年";

/// InternLM end-of-answer marker
pub const END_OF_ANSWER: &str = "<eoa>";

const PUNCTUATION: [(char, char); 5] = [
    (',', '，'),
    ('!', '！'),
    (':', '：'),
    (';', '；'),
    ('?', '？'),
];

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn full_width(c: char) -> Option<char> {
    PUNCTUATION
        .iter()
        .find(|(half, _)| *half == c)
        .map(|(_, full)| *full)
}

/// Normalize a decoded response.
pub fn process_response(response: &str) -> String {
    let response = response.trim().replace(TRAINING_TIME_PLACEHOLDER, TRAINING_TIME);

    let chars: Vec<char> = response.chars().collect();
    let mut out = String::with_capacity(response.len());
    for (i, &c) in chars.iter().enumerate() {
        let replaced = full_width(c).filter(|_| {
            let after_cjk = i > 0 && is_cjk(chars[i - 1]);
            let before_cjk = chars.get(i + 1).copied().is_some_and(is_cjk);
            after_cjk || before_cjk
        });
        out.push(replaced.unwrap_or(c));
    }
    out
}

/// Keep only the text before the first `<eoa>` marker.
pub fn cut_at_end_of_answer(response: &str) -> &str {
    response
        .split_once(END_OF_ANSWER)
        .map_or(response, |(head, _)| head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punctuation_next_to_cjk() {
        assert_eq!(process_response("你好,世界!"), "你好，世界！");
        assert_eq!(process_response("问题:答案;结束?"), "问题：答案；结束？");
    }

    #[test]
    fn test_ascii_punctuation_untouched() {
        assert_eq!(process_response("Hello, world!"), "Hello, world!");
        assert_eq!(process_response("a,b"), "a,b");
    }

    #[test]
    fn test_punctuation_before_cjk() {
        assert_eq!(process_response("ok,好"), "ok，好");
    }

    #[test]
    fn test_trim_and_placeholder() {
        assert_eq!(process_response("  截至[[训练时间]]  "), "截至2023年");
    }

    #[test]
    fn test_idempotent() {
        let once = process_response(" 你好,世界! [[训练时间]],ok ");
        assert_eq!(process_response(&once), once);
    }

    #[test]
    fn test_cut_at_end_of_answer() {
        assert_eq!(cut_at_end_of_answer("answer<eoa>\n<|User|>"), "answer");
        assert_eq!(cut_at_end_of_answer("no marker"), "no marker");
    }
}
