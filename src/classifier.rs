//! Rule-based routing of group-chat tasks.
//!
//! The first matching rule decides; there is no scoring.

use serde::Serialize;

/// Texts longer than this many characters are always complex.
pub const COMPLEX_LENGTH_THRESHOLD: usize = 50;
/// This many sentence terminators or more make a task complex.
pub const COMPLEX_SENTENCE_THRESHOLD: usize = 2;

/// Search, analysis, generation and execution intents in Chinese and English.
const COMPLEX_KEYWORDS: &[&str] = &[
    "搜索", "查找", "分析", "统计", "计算", "生成", "创建", "编写", "执行", "运行", "处理", "转换",
    "提取", "汇总", "对比", "评估", "search", "analyze", "calculate", "generate", "create",
    "execute", "process", "extract", "summarize", "compare", "evaluate",
];

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One completion, one reply card, no thread.
    Simple,
    /// Threaded handling with progress cards.
    Complex,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Complex => "complex",
        }
    }
}

/// Classify task text. Pure and total; `""` is simple.
pub fn classify(text: &str) -> TaskKind {
    if COMPLEX_KEYWORDS.iter().any(|keyword| text.contains(keyword)) {
        return TaskKind::Complex;
    }

    if text.chars().count() > COMPLEX_LENGTH_THRESHOLD {
        return TaskKind::Complex;
    }

    let terminators = text
        .chars()
        .filter(|c| SENTENCE_TERMINATORS.contains(c))
        .count();
    if terminators >= COMPLEX_SENTENCE_THRESHOLD {
        return TaskKind::Complex;
    }

    TaskKind::Simple
}
