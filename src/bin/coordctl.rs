//! `coordctl` — a thin CLI presentation of the data contract: list
//! agents/tasks/locks/threads, approve/reject an approval, tail the audit
//! log. It is not the product; it talks to the core through the same
//! [`agentcoord_core::session::CoordinationSession`] façade any other
//! caller would use, with no privileged access.

use agentcoord_core::config::Config;
use agentcoord_core::ids::ApprovalId;
use agentcoord_core::models::TaskStatus;
use agentcoord_core::session::{connect_kv, CoordinationSession, SessionOptions};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::HashSet;

#[derive(Parser)]
#[command(name = "coordctl", about = "Inspect and operate on an agentcoord-core deployment")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Agent registry operations
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Task queue operations
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
    /// File lock manager operations
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },
    /// Board thread operations
    Threads {
        #[command(subcommand)]
        action: ThreadsAction,
    },
    /// Approval workflow operations
    Approvals {
        #[command(subcommand)]
        action: ApprovalsAction,
    },
    /// Audit log operations
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List every known agent, with computed hung status
    List,
}

#[derive(Subcommand)]
enum TasksAction {
    /// List tasks, optionally filtered by status/tag/priority
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        min_priority: Option<i64>,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum StatusArg {
    Pending,
    Claimed,
    Completed,
    Failed,
    Escalated,
}

impl From<StatusArg> for TaskStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => TaskStatus::Pending,
            StatusArg::Claimed => TaskStatus::Claimed,
            StatusArg::Completed => TaskStatus::Completed,
            StatusArg::Failed => TaskStatus::Failed,
            StatusArg::Escalated => TaskStatus::Escalated,
        }
    }
}

#[derive(Subcommand)]
enum LocksAction {
    /// List every currently live file lock
    List,
}

#[derive(Subcommand)]
enum ThreadsAction {
    /// List board threads, optionally filtered by channel
    List {
        #[arg(long)]
        channel: Option<String>,
    },
}

#[derive(Subcommand)]
enum ApprovalsAction {
    /// List pending approval requests
    List,
    /// Approve a pending request as the given role/capabilities
    Approve {
        id: String,
        #[arg(long, default_value = "operator")]
        role: String,
    },
    /// Reject a pending request as the given role/capabilities
    Reject {
        id: String,
        #[arg(long, default_value = "operator")]
        role: String,
        #[arg(long, default_value = "rejected via coordctl")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Read audit entries from a cursor (0 = from the beginning)
    Tail {
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let kv = connect_kv(config.kv.redis_url.as_deref(), &config.kv.fallback_dir).await?;
    let session = CoordinationSession::start(
        kv,
        "operator",
        "coordctl",
        "cli inspection",
        HashSet::new(),
        SessionOptions {
            heartbeat_interval_seconds: 3600,
            ..Default::default()
        },
    )
    .await?;

    match cli.command {
        Command::Agents { action: AgentsAction::List } => {
            for agent in session.registry.list_agents().await? {
                println!(
                    "{}\t{}\t{}\t{:?}\tlast_heartbeat={}",
                    agent.id, agent.name, agent.role, agent.status, agent.last_heartbeat
                );
            }
        }
        Command::Tasks { action: TasksAction::List { status, tag, min_priority } } => {
            let tasks = session
            .queue
            .list_tasks(status.map(TaskStatus::from), tag.as_deref(), min_priority)
            .await?;
            for task in tasks {
                println!(
                    "{}\t{}\tpriority={}\tstatus={:?}\ttags={:?}",
                    task.id, task.title, task.priority, task.status, task.tags
                );
            }
        }
        Command::Locks { action: LocksAction::List } => {
            for lock in session.locks.list_locks().await? {
                println!(
                    "{}\tholder={}\tintent={}\texpires_at={}",
                    lock.path, lock.holder, lock.intent, lock.expires_at
                );
            }
        }
        Command::Threads { action: ThreadsAction::List { channel } } => {
            for thread in session.board.list_threads(channel.as_deref()).await? {
                println!(
                    "{}\tchannel={}\ttitle={}\tposts={}",
                    thread.id,
                    thread.channel,
                    thread.title,
                    thread.posts.len()
                );
            }
        }
        Command::Approvals { action } => match action {
            ApprovalsAction::List => {
                for request in session.approvals.list_pending().await? {
                    println!(
                        "{}\t{}\t{}\tapprovals={}/{}",
                        request.id,
                        request.action_type,
                        request.description,
                        request.approvals.len(),
                        request.min_approvals
                    );
                }
            }
            ApprovalsAction::Approve { id, role } => {
                let id: ApprovalId = id.parse()?;
                let status = session
                .approvals
                .approve(id, session.agent_id, &role, &HashSet::new())
                .await?;
                println!("{status:?}");
            }
            ApprovalsAction::Reject { id, role, reason } => {
                let id: ApprovalId = id.parse()?;
                let status = session
                .approvals
                .reject(id, session.agent_id, &role, &HashSet::new(), reason)
                .await?;
                println!("{status:?}");
            }
        },
        Command::Audit { action: AuditAction::Tail { cursor, limit } } => {
            for entry in session.audit.read_from(cursor, limit).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.sequence, entry.timestamp, entry.kind, entry.context, entry.reason
                );
            }
        }
    }

    session.end().await?;
    Ok(())
}
