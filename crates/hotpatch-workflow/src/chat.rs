//! Chat command dispatch
//!
//! A transport hands each inbound message to a [`ChatSession`] and sends back
//! the reply text. Slash commands map to controller operations; anything else
//! is treated as an instruction.

use hotpatch_core::{Decision, OperatorId};
use std::sync::Arc;

use crate::controller::{ProposeOutcome, WorkflowController, NOT_AUTHORIZED};

/// Records shown by `/deploylog` without an argument
pub const DEFAULT_LOG_ENTRIES: usize = 5;

/// One parsed chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Confirm,
    Cancel,
    Debug { target: String },
    Snapshot { target: String },
    Snapshots { target: String },
    Rollback { target: String, snapshot: String },
    DeployLog { entries: usize },
    HealthCheck,
    Hello,
    Quit,
    /// Free text, expected to be `<target>: <instruction>`
    Instruction(String),
}

impl std::str::FromStr for ChatCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if !line.starts_with('/') {
            return Ok(Self::Instruction(line.to_string()));
        }

        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        let one_target = |usage: &str| match args.as_slice() {
            [target] => Ok(target.to_string()),
            _ => Err(format!("Usage: {}", usage)),
        };

        match command {
            "/confirm" | "/push" => Ok(Self::Confirm),
            "/cancel" => Ok(Self::Cancel),
            "/debug" => Ok(Self::Debug {
                target: one_target("/debug <target>")?,
            }),
            "/snapshot" => Ok(Self::Snapshot {
                target: one_target("/snapshot <target>")?,
            }),
            "/snapshots" => Ok(Self::Snapshots {
                target: one_target("/snapshots <target>")?,
            }),
            "/rollback" => match args.as_slice() {
                [target, snapshot] => Ok(Self::Rollback {
                    target: target.to_string(),
                    snapshot: snapshot.to_string(),
                }),
                _ => Err("Usage: /rollback <target> <snapshot>".to_string()),
            },
            "/deploylog" => match args.as_slice() {
                [] => Ok(Self::DeployLog {
                    entries: DEFAULT_LOG_ENTRIES,
                }),
                [n] => n
                    .parse()
                    .map(|entries| Self::DeployLog { entries })
                    .map_err(|_| "Usage: /deploylog [n]".to_string()),
                _ => Err("Usage: /deploylog [n]".to_string()),
            },
            "/healthcheck" => Ok(Self::HealthCheck),
            "/hello" | "/start" => Ok(Self::Hello),
            "/quit" | "/exit" => Ok(Self::Quit),
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

/// What the transport should do after a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    Message(String),
    Quit,
}

/// Conversation with one operator
pub struct ChatSession {
    controller: Arc<WorkflowController>,
    operator: OperatorId,
}

impl ChatSession {
    pub fn new(controller: Arc<WorkflowController>, operator: impl Into<OperatorId>) -> Self {
        Self {
            controller,
            operator: operator.into(),
        }
    }

    pub fn operator(&self) -> &OperatorId {
        &self.operator
    }

    /// Handle one raw message
    pub async fn handle_line(&self, line: &str) -> ChatReply {
        match line.parse::<ChatCommand>() {
            Ok(ChatCommand::Quit) => ChatReply::Quit,
            Ok(command) => ChatReply::Message(self.handle(command).await),
            Err(usage) => ChatReply::Message(usage),
        }
    }

    /// Run a parsed command and render the reply
    pub async fn handle(&self, command: ChatCommand) -> String {
        let controller = &self.controller;
        let operator = &self.operator;

        match command {
            ChatCommand::Instruction(text) => {
                review_message(controller.propose(operator, &text).await)
            }
            ChatCommand::Confirm => controller
                .resolve(operator, Decision::Confirm)
                .await
                .to_string(),
            ChatCommand::Cancel => controller
                .resolve(operator, Decision::Cancel)
                .await
                .to_string(),
            ChatCommand::Debug { target } => {
                review_message(controller.propose_debug(operator, &target).await)
            }
            ChatCommand::Rollback { target, snapshot } => review_message(
                controller
                    .propose_restore(operator, &target, &snapshot)
                    .await,
            ),
            ChatCommand::Snapshot { target } => match controller.snapshot(operator, &target).await {
                Ok(info) => format!("Snapshot saved: {}", info.name),
                Err(rejection) => rejection.to_string(),
            },
            ChatCommand::Snapshots { target } => {
                match controller.list_snapshots(operator, &target).await {
                    Ok(list) if list.is_empty() => format!("No snapshots for {}.", target),
                    Ok(list) => list
                        .iter()
                        .map(|s| format!("{} ({} bytes)", s.name, s.bytes))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Err(rejection) => rejection.to_string(),
                }
            }
            ChatCommand::DeployLog { entries } => {
                match controller.recent_audit(operator, entries).await {
                    Ok(records) if records.is_empty() => "No logs.".to_string(),
                    Ok(records) => records
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Err(rejection) => rejection.to_string(),
                }
            }
            ChatCommand::HealthCheck => controller.health(operator).await.to_string(),
            ChatCommand::Hello => {
                if !controller.is_authorized(operator) {
                    return NOT_AUTHORIZED.to_string();
                }
                let keys: Vec<&str> = controller.targets().keys().collect();
                format!("Hotpatch ready. Targets: {}", keys.join(", "))
            }
            ChatCommand::Quit => String::new(),
        }
    }
}

fn review_message(outcome: ProposeOutcome) -> String {
    match outcome {
        ProposeOutcome::Preview(preview) => {
            format!("{}\nReply /confirm to push or /cancel to discard.", preview)
        }
        ProposeOutcome::Rejected(rejection) => rejection.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::controller::ControllerConfig;
    use crate::instruction::TargetTable;
    use crate::snapshots::SnapshotStore;
    use hotpatch_core::TargetSpec;
    use hotpatch_remote::{MemoryBlobStore, RecordingDeployTrigger, ScriptedTransform};
    use tempfile::TempDir;

    fn demo() -> TargetSpec {
        TargetSpec::new("demo", "acme", "demo-bot", "demo.py", "https://demo.example")
    }

    fn session(temp_dir: &TempDir, operator: &str) -> ChatSession {
        let controller = WorkflowController::new(
            ControllerConfig::new("42").with_error_log(temp_dir.path().join("error_log.txt")),
            TargetTable::new(vec![demo()]),
            Arc::new(MemoryBlobStore::new().with_file(&demo(), "v1", "t1")),
            Arc::new(ScriptedTransform::new().then_reply("v2")),
            Arc::new(RecordingDeployTrigger::succeeding()),
        )
        .with_audit_log(AuditLog::new(temp_dir.path().join("deploy_log.jsonl")))
        .with_snapshots(SnapshotStore::new(temp_dir.path().join("snapshots")));
        ChatSession::new(Arc::new(controller), operator)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("/confirm".parse::<ChatCommand>(), Ok(ChatCommand::Confirm));
        assert_eq!(" /cancel ".parse::<ChatCommand>(), Ok(ChatCommand::Cancel));
        assert_eq!(
            "/rollback demo 2024-01-01T00-00-00-000_demo_demo.py".parse::<ChatCommand>(),
            Ok(ChatCommand::Rollback {
                target: "demo".to_string(),
                snapshot: "2024-01-01T00-00-00-000_demo_demo.py".to_string(),
            })
        );
        assert_eq!(
            "/deploylog".parse::<ChatCommand>(),
            Ok(ChatCommand::DeployLog { entries: 5 })
        );
        assert_eq!(
            "/deploylog 12".parse::<ChatCommand>(),
            Ok(ChatCommand::DeployLog { entries: 12 })
        );
        assert_eq!(
            "demo: add /start".parse::<ChatCommand>(),
            Ok(ChatCommand::Instruction("demo: add /start".to_string()))
        );
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!("/rollback demo".parse::<ChatCommand>().is_err());
        assert!("/debug".parse::<ChatCommand>().is_err());
        assert!("/deploylog many".parse::<ChatCommand>().is_err());
        assert!("/frobnicate".parse::<ChatCommand>().is_err());
    }

    #[tokio::test]
    async fn test_propose_then_confirm() {
        let temp_dir = TempDir::new().unwrap();
        let chat = session(&temp_dir, "42");

        let reply = chat.handle_line("demo: change to v2").await;
        match reply {
            ChatReply::Message(text) => {
                assert!(text.contains("-v1"));
                assert!(text.contains("+v2"));
                assert!(text.contains("/confirm"));
            }
            ChatReply::Quit => panic!("unexpected quit"),
        }

        assert_eq!(
            chat.handle_line("/confirm").await,
            ChatReply::Message("written; deployed".to_string())
        );

        match chat.handle_line("/deploylog").await {
            ChatReply::Message(text) => assert!(text.contains("push by 42: change to v2")),
            ChatReply::Quit => panic!("unexpected quit"),
        }
    }

    #[tokio::test]
    async fn test_stranger_gets_fixed_reply() {
        let temp_dir = TempDir::new().unwrap();
        let chat = session(&temp_dir, "7");

        for line in ["demo: change to v2", "/confirm", "/hello", "/snapshot demo", "/deploylog"] {
            assert_eq!(
                chat.handle_line(line).await,
                ChatReply::Message("Not authorized.".to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_quit_and_hello() {
        let temp_dir = TempDir::new().unwrap();
        let chat = session(&temp_dir, "42");

        assert_eq!(chat.handle_line("/quit").await, ChatReply::Quit);
        assert_eq!(
            chat.handle_line("/hello").await,
            ChatReply::Message("Hotpatch ready. Targets: demo".to_string())
        );
        assert_eq!(
            chat.handle_line("/deploylog").await,
            ChatReply::Message("No logs.".to_string())
        );
    }
}
