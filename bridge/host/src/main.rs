use anyhow::Context;
use bridge_host_runtime::platform;
use bridge_host_runtime::{BusConfig, EventSender, HostBindings, Message, MessageBus, MessageType, Transport};
use std::path::PathBuf;
use std::process;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const ENV_CONFIG: &str = "BRIDGE_CONFIG";
const ENV_DISPLAY_NAME: &str = "BRIDGE_DISPLAY_NAME";
const DEFAULT_DISPLAY_NAME: &str = "Main";

const WINDOW_ID: i64 = 1;
const DISPLAY_SIZE: (i32, i32) = (1280, 720);
const DISPLAY_DENSITY: f64 = 1.0;
const RENDER_INTERVAL: Duration = Duration::from_millis(16);

fn main() {
    init_tracing();

    if let Err(err) = run() {
        tracing::error!("bridge host fatal error: {err:#}");
        process::exit(1);
    }
}

// Stdout carries frames, so logs go to stderr.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> anyhow::Result<()> {
    let config = load_config()?;
    tracing::info!(display = %display_name(), "starting bridge host");
    bridge_host_runtime::run::<NativeHost>(config)
}

fn load_config() -> anyhow::Result<BusConfig> {
    let base = match std::env::var(ENV_CONFIG) {
        Ok(path) if !path.is_empty() => {
            BusConfig::load(&path).with_context(|| format!("failed to load {ENV_CONFIG}={path}"))?
        }
        _ => BusConfig::default(),
    };
    Ok(base.with_env())
}

fn display_name() -> String {
    std::env::var(ENV_DISPLAY_NAME)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string())
}

struct NativeHost;

impl HostBindings for NativeHost {
    fn install_handlers<T: Transport>(bus: &mut MessageBus<T>) {
        bus.set_message_handler("Display.density", |ctx, _m| {
            ctx.reply().set("density", DISPLAY_DENSITY);
            Ok(())
        });

        bus.set_message_handler("Display.safe_insets", |ctx, _m| {
            let reply = ctx.reply();
            for side in ["left", "right", "top", "bottom"] {
                reply.set(side, 0);
            }
            Ok(())
        });

        bus.set_message_handler("Application.log", |_ctx, message| {
            tracing::info!(target: "runtime", "{}", message.get_string("message"));
            Ok(())
        });

        bus.set_message_handler("Application.quit", |ctx, _m| {
            tracing::info!("runtime requested quit");
            ctx.stop();
            Ok(())
        });
    }

    fn launch_messages() -> Vec<Message> {
        let data_folder = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let cache_folder = std::env::temp_dir().join("bridge_host");

        vec![
            platform::application_on_launch(
                &data_folder.join("Data").to_string_lossy(),
                &data_folder.join("UserData").to_string_lossy(),
                &cache_folder.to_string_lossy(),
            ),
            platform::application_lifecycle(MessageType::ApplicationOnStart),
            platform::focus_gained(WINDOW_ID, &display_name()),
        ]
    }

    fn spawn_event_sources(events: EventSender) -> Vec<JoinHandle<()>> {
        let display = display_name();
        vec![thread::spawn(move || render_ticker(events, display))]
    }
}

fn render_ticker(events: EventSender, display: String) {
    loop {
        let frame = platform::render_event(WINDOW_ID, &display, DISPLAY_SIZE, DISPLAY_SIZE);
        // A full queue drops the frame; only a closed one ends the ticker.
        if !events.post(frame) && !events.is_connected() {
            tracing::debug!("render ticker stopping; bus is gone");
            return;
        }
        thread::sleep(RENDER_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_host_runtime::codec;
    use bridge_host_runtime::{MemoryTransport, serve};

    const CAP: usize = 1_048_576;

    #[test]
    fn native_host_answers_queries_and_quits() {
        let (local, mut peer) = MemoryTransport::pair();

        let density = Message::new("Display.density").with_correlation_id(1);
        let insets = Message::new("Display.safe_insets").with_correlation_id(2);
        let quit = Message::new("Application.quit");
        let batch = codec::encode_batch([&density, &insets, &quit], CAP).expect("encode");
        peer.transmit(&batch).expect("transmit");

        let (_transport, result) = serve::<NativeHost, _>(local, BusConfig::default());
        result.expect("serve");

        let mut sent = Vec::new();
        loop {
            let bytes = peer.receive().expect("receive");
            if bytes.is_empty() {
                break;
            }
            sent.extend(codec::decode_batch(&bytes, CAP).expect("decode"));
        }

        let replies: Vec<&Message> = sent.iter().filter(|m| m.is_reply()).collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].correlation_id(), 1);
        assert_eq!(replies[0].get_double("density"), DISPLAY_DENSITY);
        assert_eq!(replies[1].len(), 4);

        assert_eq!(sent[0].type_tag(), "Application.on_launch");
        assert!(sent.iter().any(|m| m.type_tag() == "Display.focus_gained"));
    }
}
