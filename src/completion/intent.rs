//! Maps a task to a prompt style before the single completion call.

use super::Completer;
use crate::error::CompletionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Search,
    File,
    Analysis,
    Code,
    General,
}

/// Keyword groups in priority order; the first group with a hit wins.
const INTENT_KEYWORDS: &[(Intent, &[&str])] = &[
    (Intent::Search, &["搜索", "查找", "search", "找"]),
    (Intent::File, &["创建文件", "生成文件", "写入", "保存", "新建文件"]),
    (Intent::Analysis, &["分析", "统计", "汇总", "报表", "数据"]),
    (Intent::Code, &["运行", "执行", "计算", "代码", "编程"]),
];

impl Intent {
    pub fn detect(text: &str) -> Self {
        let lowered = text.to_lowercase();
        INTENT_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|kw| lowered.contains(kw)))
            .map_or(Self::General, |(intent, _)| *intent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::File => "file",
            Self::Analysis => "analysis",
            Self::Code => "code",
            Self::General => "general",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Search => {
                "你是一个智能搜索助手。当用户要求搜索时，请：\n\
                 1. 理解用户的搜索需求\n\
                 2. 提供相关的搜索建议和关键词\n\
                 3. 给出清晰、有条理的回答"
            }
            Self::File => {
                "你是一个文件操作助手。当用户要求创建或操作文件时，请：\n\
                 1. 理解文件的需求和用途\n\
                 2. 提供合适的文件内容建议\n\
                 3. 给出文件保存的建议路径和名称"
            }
            Self::Analysis => {
                "你是一个数据分析助手。当用户要求分析数据时，请：\n\
                 1. 理解分析的目的和需求\n\
                 2. 提供分析方法和步骤\n\
                 3. 给出可能的结论和建议"
            }
            Self::Code => {
                "你是一个编程助手。当用户要求执行代码或编程任务时，请：\n\
                 1. 理解任务需求和目标\n\
                 2. 提供完整、可运行的代码\n\
                 3. 添加必要的注释说明\n\
                 4. 解释代码的工作原理"
            }
            Self::General => {
                "你是一个智能助手，能够帮助用户处理各种任务。请：\n\
                 1. 理解用户的需求\n\
                 2. 提供有帮助、准确的信息\n\
                 3. 用清晰、友好的方式回答"
            }
        }
    }

    pub fn user_prompt(self, task: &str, requester: &str) -> String {
        let requester = if requester.trim().is_empty() {
            "用户"
        } else {
            requester
        };
        match self {
            Self::Search => format!("用户{requester}要求搜索：{task}\n\n请提供搜索建议。"),
            Self::File => format!("用户{requester}要求：{task}\n\n请提供文件内容建议。"),
            Self::Analysis => format!("用户{requester}要求分析：{task}\n\n请提供分析方案。"),
            Self::Code => format!("用户{requester}要求：{task}\n\n请提供代码和执行结果。"),
            Self::General => format!("用户{requester}说：{task}\n\n请提供帮助。"),
        }
    }

    /// Heading and trailing hint wrapped around the model output.
    fn frame(self) -> (&'static str, &'static str) {
        match self {
            Self::Search => ("🔍 搜索结果", "💡 提示：如需更详细的搜索，可以提供更多关键词"),
            Self::File => ("📁 文件操作结果", "💡 提示：文件将保存在工作目录中"),
            Self::Analysis => ("📊 数据分析结果", "💡 提示：如需更深入的分析，请提供更多数据"),
            Self::Code => ("💻 代码执行结果", "💡 提示：代码已准备好，可以直接运行"),
            Self::General => ("✨ 处理结果", "💡 如需更多帮助，请继续提问"),
        }
    }

    pub fn render(self, output: &str) -> String {
        let (heading, hint) = self.frame();
        format!("{heading}\n\n{output}\n\n{hint}")
    }
}

/// Answer a task with exactly one completion call.
pub async fn answer(
    completer: &dyn Completer,
    task: &str,
    requester: &str,
) -> Result<String, CompletionError> {
    let intent = Intent::detect(task);
    tracing::info!(intent = intent.as_str(), "Answering task");
    let output = completer
        .complete(&intent.user_prompt(task, requester), Some(intent.system_prompt()))
        .await?;
    Ok(intent.render(&output))
}
