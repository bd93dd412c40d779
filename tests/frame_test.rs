//! Frames recorded on the wire decode back to the commands that produced them.

mod common;

use common::{BenchPsu, Psu};
use daq_link::manager::ConnectionManager;
use daq_link::protocol::{Args, BaseCommand, Command, Frame};
use daq_link::transport::mock::MockDevice;
use daq_link::transport::LineParity;

#[test]
fn test_recorded_frames_parse_back() {
    let device = MockDevice::new().with_terminator("\n");
    device.respond_with(|frame| {
        if frame.ends_with(b"?\n") {
            Some(b"12.00\n".to_vec())
        } else {
            Some(b"ACK\n".to_vec())
        }
    });
    let manager = ConnectionManager::new(device.opener());
    let psu = manager
        .open(BenchPsu::new("psu").with_address(0x21), None)
        .unwrap();
    psu.connect("COM3").unwrap();

    let cases: Vec<(Command<Psu>, Option<Args>, bool)> = vec![
        (Psu::SetVoltage.into(), Some("5.00".into()), false),
        (Psu::Output.into(), Some("1".into()), false),
        (Psu::Status.into(), None, true),
        (BaseCommand::Custom.into(), Some("SYST:ERR?".into()), true),
    ];
    for (command, args, query) in cases {
        device.clear_log();
        let sent = args.clone();
        psu.run(move |engine| {
            if query {
                engine.request_with(command, sent).map(drop)
            } else {
                engine.command_with(command, sent)
            }
        })
        .unwrap();
        let writes = device.writes();
        assert_eq!(writes[0], (LineParity::Mark, vec![0x21]));
        assert_eq!(writes[1].0, LineParity::Space);

        let parsed = Frame::parse(psu.profile(), &device.written()).unwrap();
        assert_eq!(parsed.address, Some(0x21));
        assert_eq!(parsed.command, command);
        assert_eq!(parsed.args, args);
        if command != Command::Base(BaseCommand::Custom) {
            assert_eq!(parsed.query, query);
        }
    }
}
