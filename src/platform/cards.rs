//! Interactive card templates.

use serde_json::{json, Value};

/// Lifecycle stage shown by a progress card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Processing,
    Completed,
    Error,
}

impl ProgressStage {
    fn template(self) -> &'static str {
        match self {
            Self::Processing => "wathet",
            Self::Completed => "green",
            Self::Error => "red",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Processing => "⏳ 处理中",
            Self::Completed => "✅ 已完成",
            Self::Error => "❌ 处理失败",
        }
    }
}

fn header(template: &str, title: &str) -> Value {
    json!({
        "template": template,
        "title": { "content": title, "tag": "plain_text" }
    })
}

fn markdown(content: impl Into<String>) -> Value {
    json!({ "tag": "markdown", "content": content.into() })
}

/// Single-shot answer to a simple question.
pub fn simple_response_card(question: &str, answer: &str) -> Value {
    json!({
        "config": { "wide_screen_mode": true },
        "header": header("blue", "💬 快速回复"),
        "elements": [
            markdown(format!("**问题：** {question}\n\n**回答：**\n{answer}")),
        ]
    })
}

fn column(content: String) -> Value {
    json!({
        "tag": "column",
        "width": "weighted",
        "weight": 1,
        "elements": [markdown(content)]
    })
}

/// Card that opens a task thread.
pub fn thread_header_card(task: &str, requester: &str, created_at: &str) -> Value {
    json!({
        "config": { "wide_screen_mode": true, "enable_forward": true },
        "header": header("turquoise", "📋 任务处理"),
        "elements": [
            markdown(format!("**任务内容：**\n{task}")),
            { "tag": "hr" },
            {
                "tag": "column_set",
                "flex_mode": "none",
                "columns": [
                    column(format!("**👤 发起人**\n{requester}")),
                    column(format!("**⏰ 创建时间**\n{created_at}")),
                ]
            },
            { "tag": "hr" },
            {
                "tag": "note",
                "elements": [{
                    "tag": "plain_text",
                    "content": "🤖 任务处理进展将在话题中更新，点击查看详情"
                }]
            }
        ]
    })
}

pub fn progress_card(stage: ProgressStage, body: &str) -> Value {
    json!({
        "config": { "wide_screen_mode": true },
        "header": header(stage.template(), stage.title()),
        "elements": [markdown(body)]
    })
}

/// Local wall-clock time as shown on thread header cards.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_stages_map_to_templates() {
        assert_eq!(
            progress_card(ProgressStage::Processing, "x")["header"]["template"],
            "wathet"
        );
        assert_eq!(
            progress_card(ProgressStage::Completed, "x")["header"]["template"],
            "green"
        );
        let error = progress_card(ProgressStage::Error, "boom");
        assert_eq!(error["header"]["template"], "red");
        assert_eq!(error["elements"][0]["content"], "boom");
    }

    #[test]
    fn simple_card_contains_question_and_answer() {
        let card = simple_response_card("几点了", "十点");
        let content = card["elements"][0]["content"].as_str().unwrap();
        assert!(content.contains("几点了"));
        assert!(content.contains("十点"));
    }

    #[test]
    fn thread_header_shows_requester_and_time() {
        let card = thread_header_card("生成报表", "Alice", "2024-01-01 10:00:00");
        let columns = &card["elements"][2]["columns"];
        assert!(columns[0]["elements"][0]["content"]
            .as_str()
            .unwrap()
            .contains("Alice"));
        assert!(columns[1]["elements"][0]["content"]
            .as_str()
            .unwrap()
            .contains("2024-01-01 10:00:00"));
    }
}
