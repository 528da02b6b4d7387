use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use charger_core::charger::{Charger, ChargerLinks};
use charger_core::config::ChargerConfig;
use charger_core::console::{
    self, BmsCommand, CATALOG, Command, HelpCommand, PilotCommand, StageCommand,
};
use charger_core::indicators::StatusIndicators;
use charger_core::pilot::{self, ChargePort, PilotMeasurement};
use charger_core::telemetry::{EventId, EventRecord};

use crate::plant::{POLL_STEP_MS, Plant, SimClock, SimInstant};

/// How long a new session waits for the simulated battery before polling.
const BATTERY_STARTUP_WAIT: Duration = Duration::from_secs(5);

/// Connector whose presence the operator toggles with `plug`.
#[derive(Debug, Default)]
pub struct BenchPort {
    pub present: bool,
    pub ac_on: bool,
    pub isolations: u32,
}

impl ChargePort for BenchPort {
    fn is_present(&self) -> bool {
        self.present
    }

    fn output_ac(&mut self) {
        self.ac_on = true;
    }

    fn isolate(&mut self) {
        self.ac_on = false;
        self.isolations += 1;
    }
}

/// Panel lights as the operator would see them.
#[derive(Debug, Default)]
pub struct BenchLights {
    pub fault: bool,
    pub proximity: bool,
    pub ac: bool,
}

impl StatusIndicators for BenchLights {
    fn indicate_fault(&mut self) {
        self.fault = true;
    }

    fn indicate_proximity(&mut self, connected: bool) {
        self.proximity = connected;
    }

    fn indicate_ac(&mut self, connected: bool) {
        self.ac = connected;
    }
}

pub type BenchCharger<'p, 'a> = Charger<'a, SimClock<'p, 'a>, BenchPort, BenchLights>;

pub struct Session<'p, 'a> {
    charger: BenchCharger<'p, 'a>,
    plant: &'p Plant<'a>,
    transcript: Transcript,
    seen: Option<EventId>,
}

impl<'p, 'a> Session<'p, 'a> {
    /// Builds the charger, waits for the simulated battery to come up, and
    /// logs the startup to the transcript.
    pub fn new(
        plant: &'p Plant<'a>,
        links: ChargerLinks<'a>,
        transcript: Transcript,
    ) -> io::Result<Self> {
        let charger = Charger::new(
            ChargerConfig::default(),
            links,
            SimClock::new(plant),
            BenchPort::default(),
            BenchLights::default(),
        );
        let mut session = Self {
            charger,
            plant,
            transcript,
            seen: None,
        };

        let started = session.plant.now();
        let live = session.charger.wait_for_battery(Some(BATTERY_STARTUP_WAIT));
        let waited = session.plant.now().0 - started.0;
        let line = if live {
            format!("battery live after {waited}ms")
        } else {
            format!("battery silent after {waited}ms; polling anyway")
        };
        session.record_output(&[line])?;
        Ok(session)
    }

    #[must_use]
    pub fn charger(&self) -> &BenchCharger<'p, 'a> {
        &self.charger
    }

    /// Parses and runs one console line, returning the response lines.
    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        self.transcript
            .append_line(self.plant.now(), TranscriptRole::Host, trimmed)?;

        let mut lines = match console::parse(trimmed) {
            Ok(command) => self.execute(command),
            Err(err) => vec![format!("ERR syntax {err}")],
        };
        lines.extend(self.new_events());

        self.record_output(&lines)?;
        Ok(lines)
    }

    fn execute(&mut self, command: Command<'_>) -> Vec<String> {
        match command {
            Command::Plug(present) => {
                self.charger.port_mut().present = present;
                vec![format!(
                    "OK connector {}",
                    if present { "seated" } else { "removed" }
                )]
            }
            Command::Pilot(pilot) => self.set_pilot(pilot),
            Command::Bms(bms) => self.drive_battery(bms),
            Command::Stage(stage) => self.drive_stages(stage),
            Command::Step(count) => {
                for _ in 0..count {
                    self.charger.poll();
                }
                vec![format!(
                    "OK stepped {count} state={}",
                    self.charger.state()
                )]
            }
            Command::Advance(span) => self.advance(span),
            Command::Status => self.status(),
            Command::History => self.history(),
            Command::Help(help) => help_lines(&help),
        }
    }

    fn set_pilot(&mut self, command: PilotCommand) -> Vec<String> {
        let measurement = PilotMeasurement::new(command.duty_percent / 100.0, command.frequency_hz);
        self.plant.set_pilot(measurement);
        vec![format!(
            "OK pilot duty={:.1}% freq={:.0}Hz advertises {:.1}A",
            command.duty_percent,
            command.frequency_hz,
            pilot::current_limit(true, measurement)
        )]
    }

    fn drive_battery(&mut self, command: BmsCommand) -> Vec<String> {
        let mut battery = self.plant.battery();
        let summary = match command {
            BmsCommand::Ready(ready) => {
                battery.ready = ready;
                format!("ready={}", on_off(ready))
            }
            BmsCommand::Kill(killed) => {
                battery.killed = killed;
                format!("kill={}", on_off(killed))
            }
            BmsCommand::Pack { volts, amps } => {
                battery.pack_volts = volts;
                battery.pack_amps = amps;
                format!("pack={volts:.1}V {amps:.1}A")
            }
            BmsCommand::Cells {
                millivolts,
                celsius,
            } => {
                battery.cell_millivolts = millivolts;
                battery.cell_celsius = celsius;
                format!("cells={millivolts:.0}mV {celsius:.1}C")
            }
            BmsCommand::Capacity { watt_hours } => {
                battery.watt_hours = watt_hours;
                format!("capacity={watt_hours:.0}Wh")
            }
            BmsCommand::Silent => {
                battery.silent = true;
                "silent".to_string()
            }
            BmsCommand::Resume => {
                battery.silent = false;
                "broadcasting".to_string()
            }
        };
        vec![format!("OK bms {summary}")]
    }

    fn drive_stages(&mut self, command: StageCommand) -> Vec<String> {
        let mut stages = self.plant.stages();
        let summary = match command {
            StageCommand::Online(online) => {
                stages.online = online;
                if online { "online" } else { "offline" }.to_string()
            }
            StageCommand::Temperature(celsius) => {
                stages.celsius = celsius;
                format!("temp={celsius:.1}C")
            }
        };
        vec![format!("OK stage {summary}")]
    }

    /// Runs the poll loop until `span` of simulated time has passed, one poll
    /// per step. Isolation waits inside a poll also advance time.
    fn advance(&mut self, span: Duration) -> Vec<String> {
        let start = self.plant.now();
        let target = start + span;
        let mut polls = 0u64;
        while self.plant.now() < target {
            let step = (target.0 - self.plant.now().0).min(POLL_STEP_MS);
            self.plant.advance(step);
            self.charger.poll();
            polls += 1;
        }
        vec![format!(
            "OK advanced {}ms polls={polls} state={}",
            self.plant.now().0 - start.0,
            self.charger.state()
        )]
    }

    fn status(&self) -> Vec<String> {
        let snapshot = self.charger.snapshot();
        let battery = snapshot.battery;
        let stage = snapshot.stage;
        let lights = self.charger.indicators();
        let port = self.charger.port();
        let stage_temp = stage
            .temperature
            .map_or_else(|| "unknown".to_string(), |celsius| format!("{celsius:.0}C"));

        vec![
            format!(
                "state={} battery-fault={} stage-fault={} plugged={} t=+{}ms",
                snapshot.state,
                snapshot.battery_fault,
                snapshot.stage_fault,
                yes_no(snapshot.plugged),
                self.plant.now().0
            ),
            format!(
                "battery pack={:.1}V {:.1}A cells={:.3}V {:.1}C capacity={:.2}kWh ready={} killed={} requested={}",
                battery.pack_voltage,
                battery.pack_current,
                battery.max_cell_voltage,
                battery.max_cell_temp,
                battery.capacity_kwh,
                yes_no(battery.charge_ready),
                yes_no(battery.killed),
                yes_no(snapshot.charge_requested)
            ),
            format!(
                "stage enabled={} output={:.1}V {:.1}A temp={stage_temp} commanded={:.2}A",
                yes_no(snapshot.stage_enabled),
                stage.output_voltage,
                stage.output_current,
                snapshot.commanded_current
            ),
            format!(
                "pilot duty={:.1}% freq={:.0}Hz advertised={:.1}A",
                snapshot.pilot.duty * 100.0,
                snapshot.pilot.frequency_hz,
                snapshot.advertised_current
            ),
            format!(
                "lights fault={} proximity={} ac={} contactor={}",
                on_off(lights.fault),
                on_off(lights.proximity),
                on_off(lights.ac),
                if port.ac_on { "closed" } else { "open" }
            ),
            format!(
                "buses car-sent={} stage-sent={} dropped={}",
                self.plant.car_bus().frames_sent(),
                self.plant.stage_bus().frames_sent(),
                snapshot.dropped_frames
            ),
        ]
    }

    fn history(&self) -> Vec<String> {
        let events = self.charger.events();
        if events.is_empty() {
            return vec!["no events recorded".to_string()];
        }
        events.oldest_first().map(describe_event).collect()
    }

    fn new_events(&mut self) -> Vec<String> {
        let lines: Vec<String> = self
            .charger
            .events()
            .drain_since(self.seen)
            .map(describe_event)
            .collect();
        if let Some(latest) = self.charger.events().latest() {
            self.seen = Some(latest.id);
        }
        lines
    }

    fn record_output(&mut self, lines: &[String]) -> io::Result<()> {
        let at = self.plant.now();
        for line in lines {
            self.transcript
                .append_line(at, TranscriptRole::Emulator, line)?;
        }
        Ok(())
    }
}

fn describe_event(record: &EventRecord<SimInstant>) -> String {
    format!(
        "event #{} +{}ms {}",
        record.id, record.timestamp.0, record.event
    )
}

fn help_lines(help: &HelpCommand<'_>) -> Vec<String> {
    match help.topic {
        Some(topic) => match console::lookup(topic) {
            Some(entry) => vec![format!("{} - {}", entry.usage, entry.summary)],
            None => vec![
                format!("No help available for `{topic}`."),
                format!("Available topics: {}", help_topic_list()),
            ],
        },
        None => {
            let mut lines = vec!["Available commands:".to_string()];
            lines.extend(
                CATALOG
                    .iter()
                    .map(|entry| format!("  {:<32} {}", entry.usage, entry.summary)),
            );
            lines.push("Type `help <topic>` for a specific command.".to_string());
            lines
        }
    }
}

fn help_topic_list() -> String {
    CATALOG
        .iter()
        .map(|entry| entry.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Session log with simulated timestamps.
pub struct Transcript {
    writer: Box<dyn Write>,
}

impl Transcript {
    /// Creates (or truncates) the transcript file at `path`.
    pub fn create(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut transcript = Self {
            writer: Box::new(BufWriter::new(file)),
        };
        transcript.write_header(header)?;
        Ok(transcript)
    }

    /// Transcript that records nothing.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            writer: Box::new(io::sink()),
        }
    }

    fn write_header(&mut self, header: &str) -> io::Result<()> {
        writeln!(self.writer, "# {header}")?;
        writeln!(
            self.writer,
            "# Timestamps are simulated milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(&mut self, at: SimInstant, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[+{:>6} ms] {} {}", at.0, role.prefix(), line)?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use charger_core::bms::BatteryFault;
    use charger_core::charger::ChargeState;

    use super::*;
    use crate::plant::Bench;

    fn with_session(test: impl FnOnce(&mut Session<'_, '_>)) {
        let mut bench = Bench::new();
        let (plant, links) = bench.wire();
        let mut session = Session::new(&plant, links, Transcript::discard()).unwrap();
        test(&mut session);
    }

    fn run(session: &mut Session<'_, '_>, lines: &[&str]) -> Vec<String> {
        let mut output = Vec::new();
        for line in lines {
            output.extend(session.handle_command(line).unwrap());
        }
        output
    }

    fn start_charging(session: &mut Session<'_, '_>) {
        run(
            session,
            &[
                "bms ready on",
                "stage online",
                "pilot duty=50 freq=1000",
                "plug in",
                "advance 1s",
            ],
        );
        assert_eq!(session.charger().state(), ChargeState::Charging);
    }

    #[test]
    fn startup_waits_for_the_battery() {
        with_session(|session| {
            assert!(session.charger().bms().is_live(session.plant.now()));
            assert_eq!(session.charger().state(), ChargeState::Idle);
        });
    }

    #[test]
    fn bench_walks_through_a_charge() {
        with_session(|session| {
            start_charging(session);

            let status = run(session, &["status"]);
            assert!(status[0].starts_with("state=charging"), "{status:?}");
            // 0.95 * 240 V * 30 A / (380 V * 2 stages)
            assert!(status[2].contains("commanded=9.00A"), "{status:?}");
            assert!(status[2].contains("output=380.0V 9.0A"), "{status:?}");
            assert!(session.plant.battery().charge_requested);
            assert!(session.charger().indicators().ac);
        });
    }

    #[test]
    fn unplugging_isolates_and_reports_it() {
        with_session(|session| {
            start_charging(session);

            let output = run(session, &["plug out", "step"]);
            assert!(output.iter().any(|line| line.contains("charging -> idle")));
            assert!(output.iter().any(|line| line.contains("isolated after")));
            assert!(!output.iter().any(|line| line.contains("timed out")));
            assert!(!session.charger().port().ac_on);
            assert!(session.charger().stage().output_current() < 0.01);
        });
    }

    #[test]
    fn kill_latches_until_restart() {
        with_session(|session| {
            run(session, &["plug in", "advance 200ms", "bms kill on", "advance 200ms"]);
            assert_eq!(session.charger().state(), ChargeState::FaultLatching);
            assert_eq!(session.charger().battery_fault(), BatteryFault::Killed);

            run(session, &["bms kill off", "plug out", "advance 1s"]);
            assert_eq!(session.charger().state(), ChargeState::FaultLatching);
            assert!(session.charger().indicators().fault);
        });
    }

    #[test]
    fn silent_battery_times_out() {
        with_session(|session| {
            run(session, &["bms silent", "advance 2s"]);
            assert_eq!(session.charger().state(), ChargeState::Idle);

            let output = run(session, &["advance 1s"]);
            assert_eq!(session.charger().state(), ChargeState::FaultLatching);
            assert!(
                output
                    .iter()
                    .any(|line| line.contains("battery-fault comms-timeout"))
            );
        });
    }

    #[test]
    fn hot_stage_faults_and_recovers_after_unplug() {
        with_session(|session| {
            start_charging(session);
            run(session, &["stage temp=60", "advance 200ms"]);
            assert_eq!(session.charger().state(), ChargeState::FaultResettable);

            run(session, &["stage temp=30", "plug out", "advance 300ms"]);
            assert_eq!(session.charger().state(), ChargeState::Idle);
        });
    }

    #[test]
    fn syntax_errors_are_reported_without_side_effects() {
        with_session(|session| {
            let output = run(session, &["pilot duty=150 freq=1000"]);
            assert_eq!(output.len(), 1);
            assert!(output[0].starts_with("ERR syntax"), "{output:?}");
            assert_eq!(session.plant.pilot_signal(), PilotMeasurement::default());
        });
    }

    #[test]
    fn help_covers_every_command() {
        with_session(|session| {
            let output = run(session, &["help"]);
            for entry in CATALOG {
                assert!(
                    output.iter().any(|line| line.contains(entry.usage)),
                    "missing {}",
                    entry.name
                );
            }
            let unknown = run(session, &["help reboot"]);
            assert!(unknown[0].contains("No help available"));
        });
    }

    #[test]
    fn history_lists_events_in_order() {
        with_session(|session| {
            assert_eq!(run(session, &["history"]), vec!["no events recorded"]);
            run(session, &["plug in", "step"]);
            let history = run(session, &["history"]);
            assert_eq!(history.len(), 1);
            assert!(history[0].contains("idle -> connected"), "{history:?}");
        });
    }
}
