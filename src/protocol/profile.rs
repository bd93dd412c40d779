//! Per-device wire policy.
//!
//! Instruments on the bench disagree on nearly everything: separator, line
//! terminator, ACK token, query marker, baud rate and turnaround time. A
//! [`DeviceProfile`] collects these as overridable constants; the engine reads
//! them instead of hard-coding any of them.

use crate::protocol::command::{BaseCommand, Command, CommandTable, DeviceCommand};
use crate::transport::{LineParity, LineSettings};
use std::borrow::Cow;
use std::time::Duration;

/// How replies are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Text lines.
    #[default]
    Ascii,
    /// Raw byte blocks of known length.
    Binary,
}

/// Control characters stripped from replies when trimming is enabled.
pub const FLOW_CONTROL_CHARS: [char; 2] = ['\u{13}', '\u{11}'];

/// Wire policy of one instrument model.
pub trait DeviceProfile: Send + Sync + 'static {
    /// Device-specific command set.
    type Command: DeviceCommand;

    /// Model name used in logs and as the queue owner label.
    fn name(&self) -> &str;

    /// Command templates.
    fn table(&self) -> &CommandTable<Self::Command>;

    /// Substring the identification reply must contain.
    fn identification(&self) -> &str;

    /// Line speed.
    fn baud_rate(&self) -> u32 {
        57600
    }

    /// Typical turnaround of one exchange.
    fn basic_timeout(&self) -> Duration {
        Duration::from_millis(100)
    }

    /// Address byte sent with mark parity before every frame (9-bit mode).
    fn address(&self) -> Option<u8> {
        None
    }

    /// Terminator appended to every frame.
    fn newline(&self) -> Option<&str> {
        Some("\r")
    }

    /// Terminator of reply lines.
    fn reply_terminator(&self) -> &str {
        self.newline().unwrap_or("\n")
    }

    /// Token a device returns after a command without data.
    fn ack(&self) -> Option<&str> {
        Some("ACK")
    }

    /// Separator between template and arguments.
    fn arg_separator(&self) -> &str {
        " "
    }

    /// Marker appended to non-empty templates of requests.
    fn query_marker(&self) -> Option<&str> {
        Some("?")
    }

    /// Strip XON/XOFF characters from replies.
    fn trim_control_chars(&self) -> bool {
        true
    }

    /// Reply framing.
    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Ascii
    }

    /// Best-effort command sent before the port is closed.
    fn pre_disconnect(&self) -> Option<Command<Self::Command>> {
        Some(Command::Base(BaseCommand::Reset))
    }

    /// Failed exchanges in a row that trigger a disconnect.
    fn max_errors(&self) -> u32 {
        3
    }

    /// Idle wait of the worker queue; `None` disables idle timeouts.
    fn idle_wait(&self) -> Option<Duration> {
        None
    }

    /// Rewrite a template before framing, e.g. to fill in a channel number.
    fn expand_template<'t>(&self, template: &'t str) -> Cow<'t, str> {
        Cow::Borrowed(template)
    }

    /// Line parameters derived from the profile.
    fn line_settings(&self) -> LineSettings {
        let basic = self.basic_timeout();
        LineSettings {
            baud_rate: self.baud_rate(),
            parity: if self.address().is_some() {
                LineParity::Space
            } else {
                LineParity::None
            },
            read_timeout: basic,
            write_timeout: basic,
            settle_time: basic,
            ..LineSettings::default()
        }
    }
}
