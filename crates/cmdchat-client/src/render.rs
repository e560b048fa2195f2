//! Envelope rendering — the sink the receive loop feeds.
//!
//! Three renderers: `rich` (styled terminal output), `minimal` (plain
//! lines), and `json` (one JSON object per envelope, for piping).

use clap::ValueEnum;
use console::style;

use cmdchat_core::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RendererKind {
    Rich,
    Minimal,
    Json,
}

/// Where decrypted envelopes and local status lines go.
pub trait Renderer: Send {
    fn render(&mut self, envelope: &Envelope);

    /// A local (non-protocol) status line: connection state, help, errors.
    fn status(&mut self, line: &str);

    fn clear(&mut self);
}

pub fn make(kind: RendererKind) -> Box<dyn Renderer> {
    match kind {
        RendererKind::Rich => Box::new(RichRenderer { term: console::Term::stdout() }),
        RendererKind::Minimal => Box::new(MinimalRenderer),
        RendererKind::Json => Box::new(JsonRenderer),
    }
}

/// `ts` unix-ms to a `HH:MM:SS` UTC clock string.
fn clock(ts: u64) -> String {
    let secs_of_day = (ts / 1000) % 86_400;
    format!(
        "{:02}:{:02}:{:02}",
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60
    )
}

struct RichRenderer {
    term: console::Term,
}

impl Renderer for RichRenderer {
    fn render(&mut self, envelope: &Envelope) {
        match envelope {
            Envelope::Chat { sender, text, ts, .. } => {
                println!(
                    "{} {} {}",
                    style(clock(*ts)).dim(),
                    style(format!("{sender}:")).cyan().bold(),
                    text
                );
            }
            Envelope::System { text } => {
                println!("{}", style(format!("* {text}")).yellow());
            }
            Envelope::Error { code, message } => {
                println!("{}", style(format!("! {code}: {message}")).red());
            }
            Envelope::FileStart { sender, filename, size, .. } => {
                println!(
                    "{}",
                    style(format!("* {sender} is sending {filename} ({size} bytes)")).magenta()
                );
            }
            Envelope::FileEnd { sender, transfer_id } => {
                println!(
                    "{}",
                    style(format!("* transfer {transfer_id} from {sender} complete")).magenta()
                );
            }
            // Chunks and keepalives are noise at the terminal.
            _ => {}
        }
    }

    fn status(&mut self, line: &str) {
        println!("{}", style(format!("- {line}")).dim());
    }

    fn clear(&mut self) {
        let _ = self.term.clear_screen();
    }
}

struct MinimalRenderer;

impl Renderer for MinimalRenderer {
    fn render(&mut self, envelope: &Envelope) {
        match envelope {
            Envelope::Chat { sender, text, ts, .. } => {
                println!("[{}] {sender}: {text}", clock(*ts));
            }
            Envelope::System { text } => println!("* {text}"),
            Envelope::Error { code, message } => println!("! {code}: {message}"),
            Envelope::FileStart { sender, filename, size, .. } => {
                println!("* {sender} sending {filename} ({size} bytes)");
            }
            Envelope::FileEnd { transfer_id, .. } => {
                println!("* transfer {transfer_id} complete");
            }
            _ => {}
        }
    }

    fn status(&mut self, line: &str) {
        println!("- {line}");
    }

    fn clear(&mut self) {
        // Nothing sensible to clear in plain-line mode.
    }
}

/// One JSON line per envelope, chunks included; meant for machine
/// consumption, so local status goes to stderr.
struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn render(&mut self, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "envelope does not serialize"),
        }
    }

    fn status(&mut self, line: &str) {
        eprintln!("{line}");
    }

    fn clear(&mut self) {}
}
