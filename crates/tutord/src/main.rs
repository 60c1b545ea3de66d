//! tutord - The tutoring session service
//!
//! This is the main entry point for the tutord service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Job scheduler and boot-time replay
//! - Session engine
//! - IPC server and realtime event routing

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tutor_api::{Actor, ClientInfo, Command, ErrorCode, ErrorInfo, Response, ResponsePayload};
use tutor_config::load_config_or_default;
use tutor_core::{CoreError, SessionEngine};
use tutor_ipc::{IpcServer, ServerMessage};
use tutor_notify::TracingNotifier;
use tutor_store::{HistoryEventType, HistoryRepo, SqliteStore};
use tutor_util::{ClientId, database_path, default_config_path};

/// tutord - Session lifecycle and durable scheduling service
#[derive(Parser, Debug)]
#[command(name = "tutord")]
#[command(about = "Session lifecycle and durable scheduling service for tutoring", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/tutord/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set TUTORD_SOCKET env var)
    #[arg(short, long, env = "TUTORD_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set TUTORD_DATA_DIR env var)
    #[arg(short, long, env = "TUTORD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    engine: Arc<SessionEngine>,
    ipc: Arc<IpcServer>,
    store: Arc<SqliteStore>,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let policy = load_config_or_default(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            max_reschedule_requests = policy.scheduling.max_reschedule_requests,
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| policy.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| policy.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = database_path(&data_dir);
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.with_tx(|conn| {
            HistoryRepo::record(conn, HistoryEventType::ServiceStarted, tutor_util::now())
        })?;

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        let engine = SessionEngine::build(
            store.clone(),
            Arc::new(TracingNotifier),
            Arc::new(ipc.emitter()),
            policy.scheduling,
        );

        Ok(Self {
            engine: Arc::new(engine),
            ipc: Arc::new(ipc),
            store,
        })
    }

    async fn run(self) -> Result<()> {
        // Re-arm or run everything persisted before taking any traffic
        let summary = self
            .engine
            .replay_pending(tutor_util::now())
            .await
            .context("Failed to replay queued jobs")?;
        info!(
            armed = summary.armed,
            fired = summary.fired,
            dropped = summary.dropped,
            "Scheduler ready"
        );

        let ipc_ref = self.ipc.clone();
        let mut ipc_messages = ipc_ref
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let engine = self.engine.clone();
        let store = self.store.clone();

        let ipc_accept = ipc_ref.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

        let sweep_period = engine
            .policy()
            .sweep_interval
            .to_std()
            .context("Sweep interval out of range")?;
        let mut sweep_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + sweep_period, sweep_period);

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                // Periodic removal of failed and long-overdue job rows
                _ = sweep_timer.tick() => {
                    if let Err(e) = engine.sweep(tutor_util::now()) {
                        warn!(error = %e, "Job sweep failed");
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    Self::handle_ipc_message(&engine, &ipc_ref, &store, msg).await;
                }
            }
        }

        info!("Shutting down tutord");

        // Queued rows stay in the store and are replayed on the next boot
        engine.scheduler().shutdown();

        if let Err(e) = store.with_tx(|conn| {
            HistoryRepo::record(conn, HistoryEventType::ServiceStopped, tutor_util::now())
        }) {
            warn!(error = %e, "Failed to log service shutdown");
        }

        info!("Shutdown complete");
        Ok(())
    }

    async fn handle_ipc_message(
        engine: &Arc<SessionEngine>,
        ipc: &Arc<IpcServer>,
        store: &Arc<SqliteStore>,
        msg: ServerMessage,
    ) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                let Some(info) = ipc.get_client_info(&client_id).await else {
                    debug!(client_id = %client_id, "Request from departed client");
                    return;
                };

                let response =
                    Self::handle_command(engine, &client_id, &info, request.request_id, request.command)
                        .await;

                let _ = ipc.send_response(&client_id, response).await;
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = store.with_tx(|conn| {
                    HistoryRepo::record(
                        conn,
                        HistoryEventType::ClientConnected {
                            client_id: client_id.to_string(),
                            role: format!("{:?}", info.role),
                            uid: info.uid,
                        },
                        tutor_util::now(),
                    )
                });
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = store.with_tx(|conn| {
                    HistoryRepo::record(
                        conn,
                        HistoryEventType::ClientDisconnected {
                            client_id: client_id.to_string(),
                        },
                        tutor_util::now(),
                    )
                });
            }
        }
    }

    async fn handle_command(
        engine: &SessionEngine,
        client_id: &ClientId,
        info: &ClientInfo,
        request_id: u64,
        command: Command,
    ) -> Response {
        let now = tutor_util::now();

        if command.requires_admin() && !info.role.can_administer() {
            return Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
            );
        }

        if matches!(command_actor(&command), Some(Actor::System)) && !info.role.can_administer() {
            return Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "Only admin clients act as system"),
            );
        }

        let result = match command {
            Command::RegisterPairing {
                user_id,
                teacher_id,
            } => engine
                .register_pairing(user_id, teacher_id, now)
                .map(|pairing| ResponsePayload::PairingRegistered { pairing }),

            Command::SetBalance {
                user_id,
                remaining_sessions,
            } => engine
                .set_balance(&user_id, remaining_sessions)
                .map(|_| ResponsePayload::BalanceSet),

            Command::ListJobs => engine.list_jobs().map(|jobs| ResponsePayload::Jobs { jobs }),

            Command::CreateSession {
                pairing_id,
                scheduled_at,
                duration_minutes,
                kind,
            } => engine
                .create_session(&pairing_id, scheduled_at, duration_minutes, kind, now)
                .await
                .map(|session| ResponsePayload::SessionCreated { session }),

            Command::CreateSessionSeries {
                pairing_id,
                first_at,
                duration_minutes,
                count,
                every_days,
                kind,
            } => engine
                .create_session_series(
                    &pairing_id,
                    first_at,
                    duration_minutes,
                    count,
                    every_days,
                    kind,
                    now,
                )
                .await
                .map(|sessions| ResponsePayload::SeriesCreated { sessions }),

            Command::CheckAvailability {
                teacher_id,
                candidates,
                duration_minutes,
            } => engine
                .check_availability(&teacher_id, &candidates, duration_minutes)
                .map(|conflicts| ResponsePayload::Availability { conflicts }),

            Command::GetSession { session_id } => {
                engine.get_session(&session_id).map(ResponsePayload::Session)
            }

            Command::SetMeetingLink {
                session_id,
                actor,
                meeting_link,
            } => engine
                .set_meeting_link(&session_id, &actor, &meeting_link, now)
                .await
                .map(|session| ResponsePayload::SessionUpdated { session }),

            Command::RecordAttendance {
                session_id,
                actor,
                attended,
            } => engine
                .record_attendance(&session_id, &actor, attended, now)
                .await
                .map(|session| ResponsePayload::SessionUpdated { session }),

            Command::TransitionStatus {
                session_id,
                actor,
                target,
            } => engine
                .transition_status(&session_id, &actor, target, now)
                .await
                .map(|session| ResponsePayload::SessionUpdated { session }),

            Command::RecordContinuation {
                pairing_id,
                actor,
                will_continue,
            } => engine
                .record_continuation(&pairing_id, &actor, will_continue)
                .map(|pairing| ResponsePayload::PairingUpdated { pairing }),

            Command::RequestReschedule {
                session_id,
                actor,
                candidate_dates,
            } => engine
                .request_reschedule(&session_id, &actor, &candidate_dates, now)
                .await
                .map(|request| ResponsePayload::RescheduleRequested { request }),

            Command::RespondToReschedule {
                request_id: reschedule_id,
                actor,
                decision,
                chosen_date,
            } => engine
                .respond_to_reschedule(&reschedule_id, &actor, decision, chosen_date.as_deref(), now)
                .await
                .map(|request| ResponsePayload::RescheduleResolved { request }),

            Command::CancelReschedule {
                request_id: reschedule_id,
                actor,
            } => engine
                .cancel_reschedule(&reschedule_id, &actor, now)
                .await
                .map(|_| ResponsePayload::RescheduleCancelled),

            // Routing is applied by the IPC server before the request arrives here
            Command::SubscribeEvents { recipient } => {
                info!(client_id = %client_id, recipient = %recipient, "Client subscribed to events");
                Ok(ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                })
            }

            Command::UnsubscribeEvents => Ok(ResponsePayload::Unsubscribed),

            Command::GetHealth => Ok(ResponsePayload::Health(engine.health())),

            Command::Ping => Ok(ResponsePayload::Pong),
        };

        match result {
            Ok(payload) => Response::success(request_id, payload),
            Err(e) => {
                debug!(client_id = %client_id, code = e.code(), error = %e, "Command rejected");
                Response::error(request_id, error_info(&e))
            }
        }
    }
}

/// The actor a command acts as, if it names one
fn command_actor(command: &Command) -> Option<&Actor> {
    match command {
        Command::SetMeetingLink { actor, .. }
        | Command::RecordAttendance { actor, .. }
        | Command::TransitionStatus { actor, .. }
        | Command::RecordContinuation { actor, .. }
        | Command::RequestReschedule { actor, .. }
        | Command::RespondToReschedule { actor, .. }
        | Command::CancelReschedule { actor, .. } => Some(actor),
        _ => None,
    }
}

fn error_info(e: &CoreError) -> ErrorInfo {
    let code = match e {
        CoreError::Validation(_) => ErrorCode::Validation,
        CoreError::Conflict(_) => ErrorCode::Conflict,
        CoreError::Authorization(_) => ErrorCode::Unauthorized,
        CoreError::NotFound(_) => ErrorCode::NotFound,
        CoreError::Store(_) => ErrorCode::StoreError,
    };
    ErrorInfo::new(code, e.to_string()).with_reason(e.code())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tutord starting");

    let service = Service::new(&args).await?;
    service.run().await
}
