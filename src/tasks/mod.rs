//! Group-chat task lifecycle: one background unit per task, strictly
//! sequential replies within it.

use crate::classifier::TaskKind;
use crate::completion::{intent, Completer};
use crate::error::TaskError;
use crate::platform::cards::{self, ProgressStage};
use crate::platform::{Messenger, SendMessage};
use crate::stats::StatsCollector;
use crate::util::truncate_with_ellipsis;
use futures_util::future::BoxFuture;
use std::sync::Arc;

pub const THREAD_CREATION_FAILED_TEXT: &str = "❌ 创建任务话题失败";
pub const PROCESSING_TEXT: &str = "正在分析任务需求...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub display_name: String,
    pub stable_id: String,
}

/// One unit of group-chat work. `kind` is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub description: String,
    pub requester: Requester,
    pub origin_chat: String,
    pub origin_message: String,
    pub kind: TaskKind,
}

/// Starts background work that nobody waits on.
pub trait TaskSpawner: Send + Sync {
    fn spawn_detached(&self, label: &'static str, future: BoxFuture<'static, ()>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn_detached(&self, label: &'static str, future: BoxFuture<'static, ()>) {
        tracing::debug!(label, "Spawning background task");
        tokio::spawn(future);
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    messenger: Arc<dyn Messenger>,
    completer: Arc<dyn Completer>,
    stats: Arc<StatsCollector>,
}

fn error_detail(err: &dyn std::fmt::Display) -> String {
    format!("错误信息：\n```\n{err}\n```")
}

impl TaskRunner {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        completer: Arc<dyn Completer>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            messenger,
            completer,
            stats,
        }
    }

    /// Hand the task to `spawner`; returns without waiting for it.
    pub fn spawn(&self, task: Task, spawner: &dyn TaskSpawner) {
        let runner = self.clone();
        let label = match task.kind {
            TaskKind::Simple => "simple-task",
            TaskKind::Complex => "complex-task",
        };
        spawner.spawn_detached(label, Box::pin(async move { runner.run(task).await }));
    }

    /// Drive the task to its terminal reply. Errors are turned into chat
    /// messages here and never returned.
    pub async fn run(&self, task: Task) {
        tracing::info!(
            kind = task.kind.as_str(),
            chat_id = %task.origin_chat,
            "Processing task: {}",
            truncate_with_ellipsis(&task.description, 50)
        );
        match task.kind {
            TaskKind::Simple => self.run_simple(&task).await,
            TaskKind::Complex => {
                if let Err(err) = self.run_complex(&task).await {
                    tracing::error!(chat_id = %task.origin_chat, "Complex task aborted: {err}");
                }
            }
        }
    }

    async fn run_simple(&self, task: &Task) {
        let answer = match intent::answer(
            self.completer.as_ref(),
            &task.description,
            &task.requester.display_name,
        )
        .await
        {
            Ok(answer) => answer,
            Err(err) => {
                tracing::error!("Simple task completion failed: {err}");
                format!("❌ 处理失败: {err}")
            }
        };

        let card = cards::simple_response_card(&task.description, &answer);
        if let Err(err) = self
            .messenger
            .send(&SendMessage::card(&task.origin_chat, card))
            .await
        {
            tracing::error!("Simple task reply failed: {err}");
            let fallback = SendMessage::text(&task.origin_chat, format!("❌ 处理失败：{err}"));
            if let Err(err) = self.messenger.send(&fallback).await {
                tracing::error!("Fallback reply failed: {err}");
            }
        }
    }

    async fn run_complex(&self, task: &Task) -> Result<(), TaskError> {
        let thread_id = match self.open_thread(task).await {
            Ok(thread_id) => thread_id,
            Err(err) => {
                tracing::error!("Thread creation failed: {err}");
                let notice = SendMessage::text(&task.origin_chat, THREAD_CREATION_FAILED_TEXT);
                self.messenger.send(&notice).await?;
                return Err(err);
            }
        };
        tracing::info!(thread_id = %thread_id, "Task thread created");

        if let Err(err) = self.process_in_thread(task, &thread_id).await {
            tracing::error!(thread_id = %thread_id, "Task failed: {err}");
            let card = cards::progress_card(ProgressStage::Error, &error_detail(&err));
            self.messenger
                .send(&SendMessage::card_in_thread(&task.origin_chat, &thread_id, card))
                .await?;
        }
        Ok(())
    }

    async fn open_thread(&self, task: &Task) -> Result<String, TaskError> {
        let header = cards::thread_header_card(
            &task.description,
            &task.requester.display_name,
            &cards::timestamp_now(),
        );
        let delivery = self
            .messenger
            .send(&SendMessage::thread_opening_reply(&task.origin_message, header))
            .await
            .map_err(|err| TaskError::ThreadCreationFailed(err.to_string()))?;
        delivery
            .thread_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TaskError::ThreadCreationFailed("no thread id returned".into()))
    }

    async fn process_in_thread(&self, task: &Task, thread_id: &str) -> Result<(), TaskError> {
        let post = |stage: ProgressStage, body: &str| {
            SendMessage::card_in_thread(
                &task.origin_chat,
                thread_id,
                cards::progress_card(stage, body),
            )
        };

        self.messenger
            .send(&post(ProgressStage::Processing, PROCESSING_TEXT))
            .await?;

        let answer = intent::answer(
            self.completer.as_ref(),
            &task.description,
            &task.requester.display_name,
        )
        .await?;
        self.stats.increment_tasks();

        self.messenger
            .send(&post(ProgressStage::Completed, &answer))
            .await?;
        Ok(())
    }
}
