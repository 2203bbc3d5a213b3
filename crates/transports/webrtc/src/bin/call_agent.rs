//! Headless call agent
//!
//! Joins a consultation as one participant using synthetic capture devices.
//! Useful for exercising a relay deployment or answering calls from a
//! browser during testing.
//!
//! # Usage
//!
//! ```bash
//! # Wait for calls addressed to counsellor-7
//! cargo run -p campuscare-webrtc --features cli --bin call-agent -- \
//!   --participant counsellor-7 \
//!   --relay-url http://localhost:8080
//!
//! # Call student-42 with audio only
//! cargo run -p campuscare-webrtc --features cli --bin call-agent -- \
//!   --participant counsellor-7 --call student-42 --no-video
//!
//! # Join the consultation described by a call page bootstrap and dial
//! cargo run -p campuscare-webrtc --features cli --bin call-agent -- \
//!   --bootstrap appt-42.json --dial
//! ```

use campuscare_webrtc::{
    CallConfig, CallController, CallEvent, HttpMailbox, MediaAcquisition, ParticipantId,
    PollingChannel, RtcEngineFactory, SessionBootstrap,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CampusCare call agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Participant id this agent signals as
    #[arg(
        short,
        long,
        env = "CAMPUSCARE_PARTICIPANT",
        required_unless_present = "bootstrap"
    )]
    participant: Option<String>,

    /// Call this participant instead of waiting for an offer
    #[arg(long, conflicts_with = "dial")]
    call: Option<String>,

    /// Call page bootstrap (JSON) naming both participants
    #[arg(short, long)]
    bootstrap: Option<PathBuf>,

    /// Call the bootstrap's remote participant instead of waiting
    #[arg(long, default_value_t = false, requires = "bootstrap")]
    dial: bool,

    /// Config file (toml, yaml or json)
    #[arg(short, long, env = "CAMPUSCARE_CALL_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling relay base URL, overrides the config file
    #[arg(long, env = "CAMPUSCARE_RELAY_URL")]
    relay_url: Option<String>,

    /// Poll interval in milliseconds, overrides the config file
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Do not capture video
    #[arg(long, default_value_t = false)]
    no_video: bool,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "CAMPUSCARE_LOG_JSON")]
    log_json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, exiting now");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, hanging up...");
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("call-agent")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

fn load_config(args: &Args) -> campuscare_webrtc::Result<CallConfig> {
    let mut config = match &args.config {
        Some(path) => CallConfig::load(path)?,
        None => CallConfig::default(),
    };
    if let Some(url) = &args.relay_url {
        config = config.with_relay_url(url);
    }
    if let Some(ms) = args.poll_interval_ms {
        config = config.with_poll_interval_ms(ms);
    }
    if args.no_video {
        config.media.video = false;
    }
    config.validate()?;
    Ok(config)
}

/// Who this agent is and whom it calls, if anyone
fn resolve_participants(
    args: &Args,
) -> campuscare_webrtc::Result<(ParticipantId, Option<ParticipantId>)> {
    if let Some(path) = &args.bootstrap {
        let bootstrap = SessionBootstrap::load(path)?;
        let descriptor = bootstrap.descriptor();
        for participant in bootstrap.participants() {
            info!(
                session = %descriptor.session_id,
                id = %participant.id,
                name = %participant.display_name,
                initials = %participant.initials,
                local = participant.is_local,
                "Session participant"
            );
        }
        let remote = if args.dial {
            Some(descriptor.remote_participant_id.clone())
        } else {
            args.call.clone().map(ParticipantId::new)
        };
        return Ok((descriptor.local_participant_id, remote));
    }

    let local = args
        .participant
        .clone()
        .map(ParticipantId::new)
        .ok_or_else(|| {
            campuscare_webrtc::Error::InvalidConfig(
                "either --participant or --bootstrap is required".to_string(),
            )
        })?;
    Ok((local, args.call.clone().map(ParticipantId::new)))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    let (participant, remote) = resolve_participants(&args)?;
    info!(
        version = campuscare_webrtc::version(),
        participant = %participant,
        relay_url = %config.signaling.relay_url,
        poll_interval_ms = config.signaling.poll_interval_ms,
        "Call agent starting"
    );

    let mailbox = Arc::new(HttpMailbox::new(&config.signaling.relay_url)?);
    let signaling = Arc::new(PollingChannel::from_config(mailbox, &config.signaling));
    let engines = Arc::new(RtcEngineFactory::new(&config)?);

    let (controller, mut events) = CallController::new(
        participant,
        config,
        MediaAcquisition::synthetic(),
        signaling,
        engines,
    )?;

    match &remote {
        Some(remote) => {
            let call_id = controller.start_call(remote.clone()).await?;
            info!(%call_id, remote = %remote, "Offer sent");
        }
        None => {
            controller.listen().await?;
            info!("Waiting for incoming calls");
        }
    }

    let mut shutdown_check = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
                if matches!(event, CallEvent::CallEnded { .. }) && remote.is_some() {
                    break;
                }
            }
            _ = shutdown_check.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    if let Err(e) = controller.end_call().await {
        error!("Failed to end call: {}", e);
    }
    info!("Call agent stopped");
    Ok(())
}

fn log_event(event: &CallEvent) {
    match event {
        CallEvent::LocalStream(stream) => {
            info!(stream = stream.id(), tracks = stream.track_count(), "Local media ready")
        }
        CallEvent::RemoteStream(stream) => {
            info!(tracks = stream.track_count(), "Remote media received")
        }
        CallEvent::ConnectionStateChanged(state) => info!(%state, "Connection state changed"),
        CallEvent::Error { kind, detail } => warn!(?kind, %detail, "Call error"),
        CallEvent::IncomingCall { from, call_id } => {
            info!(%from, %call_id, "Incoming call accepted")
        }
        CallEvent::CallEnded { call_id, reason } => {
            info!(%call_id, reason = reason.as_deref().unwrap_or("none"), "Call ended")
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
