//! Command identifiers and per-device command tables.
//!
//! Every device shares the [`BaseCommand`] set and adds its own closed enum
//! implementing [`DeviceCommand`]. The table maps device commands through a
//! plain function, so a device enum with a missing template does not compile.

use std::borrow::Cow;
use std::fmt;
use std::hash::Hash;

/// Commands every device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseCommand {
    /// Identification query used by initialisation.
    Init,
    /// Return the device to its power-on state.
    Reset,
    /// Stop whatever the device is doing.
    Abort,
    /// Raw text; the arguments are sent as they are.
    Custom,
    /// No operation.
    Nop,
}

impl BaseCommand {
    /// Every base command.
    pub const ALL: &'static [BaseCommand] = &[
        BaseCommand::Init,
        BaseCommand::Reset,
        BaseCommand::Abort,
        BaseCommand::Custom,
        BaseCommand::Nop,
    ];

    /// Display name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            BaseCommand::Init => "Init",
            BaseCommand::Reset => "Reset",
            BaseCommand::Abort => "Abort",
            BaseCommand::Custom => "Custom",
            BaseCommand::Nop => "Nop",
        }
    }
}

/// Closed set of device-specific commands.
pub trait DeviceCommand: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every variant, used to decode recorded frames.
    const ALL: &'static [Self];

    /// Display name used in logs and errors.
    fn name(self) -> &'static str;
}

/// Command set of a device without commands of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoDeviceCommands {}

impl DeviceCommand for NoDeviceCommands {
    const ALL: &'static [Self] = &[];

    fn name(self) -> &'static str {
        match self {}
    }
}

/// A base or device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command<D> {
    /// Shared command.
    Base(BaseCommand),
    /// Device-specific command.
    Device(D),
}

impl<D: DeviceCommand> Command<D> {
    /// Display name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Command::Base(base) => base.name(),
            Command::Device(device) => device.name(),
        }
    }

    /// Every command of this set, base commands first.
    pub fn all() -> impl Iterator<Item = Command<D>> {
        BaseCommand::ALL
            .iter()
            .map(|b| Command::Base(*b))
            .chain(D::ALL.iter().map(|d| Command::Device(*d)))
    }
}

impl<D> From<BaseCommand> for Command<D> {
    fn from(base: BaseCommand) -> Self {
        Command::Base(base)
    }
}

impl<D: DeviceCommand> From<D> for Command<D> {
    fn from(device: D) -> Self {
        Command::Device(device)
    }
}

impl<D: DeviceCommand> fmt::Display for Command<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable mapping from command to wire template.
#[derive(Clone)]
pub struct CommandTable<D> {
    init: Cow<'static, str>,
    reset: Cow<'static, str>,
    abort: Cow<'static, str>,
    nop: Cow<'static, str>,
    device: fn(D) -> &'static str,
}

impl<D: DeviceCommand> CommandTable<D> {
    /// Table with the default base templates and `device` for the rest.
    pub fn new(device: fn(D) -> &'static str) -> Self {
        Self {
            init: Cow::Borrowed("*IDN?"),
            reset: Cow::Borrowed("*RST"),
            abort: Cow::Borrowed("ABOR"),
            nop: Cow::Borrowed(""),
            device,
        }
    }

    /// Override a base template. `Custom` always stays empty.
    pub fn with_base(mut self, command: BaseCommand, template: impl Into<Cow<'static, str>>) -> Self {
        let template = template.into();
        match command {
            BaseCommand::Init => self.init = template,
            BaseCommand::Reset => self.reset = template,
            BaseCommand::Abort => self.abort = template,
            BaseCommand::Nop => self.nop = template,
            BaseCommand::Custom => {}
        }
        self
    }

    /// Wire template of `command`.
    pub fn template(&self, command: Command<D>) -> &str {
        match command {
            Command::Base(BaseCommand::Init) => &self.init,
            Command::Base(BaseCommand::Reset) => &self.reset,
            Command::Base(BaseCommand::Abort) => &self.abort,
            Command::Base(BaseCommand::Nop) => &self.nop,
            Command::Base(BaseCommand::Custom) => "",
            Command::Device(device) => (self.device)(device),
        }
    }
}

impl CommandTable<NoDeviceCommands> {
    /// Table holding only the base commands.
    pub fn base() -> Self {
        Self::new(|never| match never {})
    }
}

impl<D: DeviceCommand> fmt::Debug for CommandTable<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for command in Command::<D>::all() {
            map.entry(&command.name(), &self.template(command));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Psu {
        SetVoltage,
        Output,
    }

    impl DeviceCommand for Psu {
        const ALL: &'static [Self] = &[Psu::SetVoltage, Psu::Output];

        fn name(self) -> &'static str {
            match self {
                Psu::SetVoltage => "SetVoltage",
                Psu::Output => "Output",
            }
        }
    }

    fn psu_template(command: Psu) -> &'static str {
        match command {
            Psu::SetVoltage => "VSET <X>",
            Psu::Output => "OUT",
        }
    }

    #[test]
    fn base_defaults_and_overrides() {
        let table = CommandTable::new(psu_template).with_base(BaseCommand::Reset, "RST");
        assert_eq!(table.template(BaseCommand::Init.into()), "*IDN?");
        assert_eq!(table.template(BaseCommand::Reset.into()), "RST");
        assert_eq!(table.template(Command::Device(Psu::SetVoltage)), "VSET <X>");
    }

    #[test]
    fn custom_template_is_always_empty() {
        let table = CommandTable::base().with_base(BaseCommand::Custom, "NOPE");
        assert_eq!(table.template(BaseCommand::Custom.into()), "");
    }

    #[test]
    fn all_lists_base_then_device() {
        let names: Vec<_> = Command::<Psu>::all().map(Command::name).collect();
        assert_eq!(names, ["Init", "Reset", "Abort", "Custom", "Nop", "SetVoltage", "Output"]);
    }
}
