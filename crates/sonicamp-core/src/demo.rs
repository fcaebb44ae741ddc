//! Demo Mode - simulated sonicamp
//!
//! An in-process sonicamp (catch, protocol 1.0.0, framed) for trying the
//! runtime without hardware. It answers every command of its lookup table,
//! runs firmware procedures for a simulated duration, adds noise to its
//! readings and now and then interleaves `LOG=` lines with its answers.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::procedures::ProcedureType;
use crate::protocol::{
    request_alias, BoxReader, BoxWriter, CommandCode, CommandLookUpTable, ConnectionFactory,
    DeviceType, Frame, FrameProtocol, IndexedField, Packet, ProtocolError, ProtocolRegistry,
    RelayMode, SonicCodec, FRAMED_VERSION,
};

const CHANNELS: usize = IndexedField::CHANNELS as usize;

struct RunningProcedure {
    kind: ProcedureType,
    started: Instant,
    duration: Duration,
    ramp: Option<DemoRamp>,
}

#[derive(Debug, Clone, Copy)]
struct DemoRamp {
    start: i64,
    step: i64,
    count: i64,
    period: Duration,
}

/// Simulated sonicamp answering request payloads
pub struct DemoSonicamp {
    table: CommandLookUpTable,
    frequency: i64,
    gain: i64,
    signal: bool,
    relay_mode: RelayMode,
    analog: bool,
    temperature: f64,
    swf: i64,
    atf: [i64; CHANNELS],
    atk: [f64; CHANNELS],
    att: [f64; CHANNELS],
    aton: [i64; CHANNELS],
    scan_duration: Duration,
    tune_duration: Duration,
    procedure: Option<RunningProcedure>,
    pending_logs: Vec<String>,
    rng: StdRng,
}

impl Default for DemoSonicamp {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoSonicamp {
    /// Simulator seeded from entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible noise
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            table: ProtocolRegistry::new().build(DeviceType::Catch, FRAMED_VERSION, true),
            frequency: 1_000_000,
            gain: 100,
            signal: false,
            relay_mode: RelayMode::Mhz,
            analog: false,
            temperature: 24.0,
            swf: 5,
            atf: [100_000, 250_000, 1_000_000, 2_000_000],
            atk: [0.0; CHANNELS],
            att: [20.0, 25.0, 30.0, 35.0],
            aton: [0; CHANNELS],
            scan_duration: Duration::from_secs(2),
            tune_duration: Duration::from_secs(2),
            procedure: None,
            pending_logs: Vec::new(),
            rng,
        }
    }

    /// Commands the simulator answers
    pub fn command_table(&self) -> &CommandLookUpTable {
        &self.table
    }

    /// Id of the running procedure, 0 when idle
    pub fn procedure_id(&self) -> i64 {
        self.procedure.as_ref().map_or(0, |p| p.kind.remote_id())
    }

    /// Answer one request payload
    pub fn handle(&mut self, request: &str) -> String {
        self.advance();
        let request = request.trim();
        let body = match self.table.find_by_request(request) {
            Some(lookup) => {
                let code = lookup.command_def.code;
                let alias = request_alias(request);
                let head = request.split_once('=').map_or(request, |(head, _)| head);
                let index = head
                    .trim()
                    .strip_prefix(alias)
                    .and_then(|rest| rest.parse::<usize>().ok());
                let value = request.split_once('=').map(|(_, value)| value.trim());
                self.execute(code, index, value)
            }
            None => format!("unknown command: {request}"),
        };

        if self.rng.gen_ratio(1, 25) {
            self.pending_logs
                .push(format!("LOG=DEBUG: temperature {:.1} C", self.temperature));
        }
        let mut payload: Vec<String> = self.pending_logs.drain(..).collect();
        payload.push(body);
        payload.join("\n")
    }

    fn advance(&mut self) {
        self.temperature = (self.temperature + self.rng.gen_range(-0.05..0.08)).clamp(15.0, 60.0);
        let Some(procedure) = &self.procedure else {
            return;
        };
        let elapsed = procedure.started.elapsed();
        if let Some(ramp) = procedure.ramp {
            let period = ramp.period.as_millis().max(1);
            let position = (elapsed.as_millis() / period) as i64;
            self.frequency = ramp.start + ramp.step * position.min(ramp.count - 1);
        }
        if elapsed >= procedure.duration {
            let kind = procedure.kind;
            self.procedure = None;
            if kind == ProcedureType::Ramp {
                self.signal = false;
            }
            self.pending_logs.push(format!("LOG=INFO: {kind} finished"));
        }
    }

    fn start_procedure(
        &mut self,
        kind: ProcedureType,
        duration: Duration,
        ramp: Option<DemoRamp>,
    ) -> String {
        if let Some(running) = &self.procedure {
            return format!("error: {} is running", running.kind);
        }
        self.signal = true;
        self.procedure = Some(RunningProcedure {
            kind,
            started: Instant::now(),
            duration,
            ramp,
        });
        self.pending_logs.push(format!("LOG=INFO: {kind} started"));
        format!("procedure={}", kind.remote_id())
    }

    fn start_ramp(&mut self, value: Option<&str>) -> String {
        let parts: Option<Vec<i64>> = value.map(|v| {
            v.split(',')
                .filter_map(|part| part.trim().parse::<i64>().ok())
                .collect()
        });
        let Some([start, stop, step, on_ms, off_ms]) = parts
            .as_deref()
            .and_then(|p| <[i64; 5]>::try_from(p).ok())
        else {
            return "error: expected start,stop,step,on_ms,off_ms".to_string();
        };
        if step == 0 {
            return "error: step must not be zero".to_string();
        }
        let step = if stop >= start { step.abs() } else { -step.abs() };
        let count = (stop - start) / step + 1;
        let period = Duration::from_millis((on_ms + off_ms).max(1) as u64);
        let ramp = DemoRamp {
            start,
            step,
            count,
            period,
        };
        self.start_procedure(ProcedureType::Ramp, period * count as u32, Some(ramp))
    }

    fn measurements(&mut self) -> (f64, f64, f64) {
        if !self.signal {
            return (0.0, 0.0, 0.0);
        }
        let gain = self.gain as f64 / 100.0;
        (
            1500.0 * gain + self.rng.gen_range(-15.0..15.0),
            300.0 * gain + self.rng.gen_range(-5.0..5.0),
            self.rng.gen_range(-8.0..8.0),
        )
    }

    fn status_record(&mut self) -> String {
        let (urms, irms, phase) = self.measurements();
        format!(
            "{}#{}#{}#{}#{:.1}#{:.1}#{:.1}#{:.1}",
            self.frequency,
            self.gain,
            u8::from(self.signal),
            self.procedure_id(),
            self.temperature,
            urms,
            irms,
            phase
        )
    }

    fn execute(&mut self, code: CommandCode, index: Option<usize>, value: Option<&str>) -> String {
        let int = value.and_then(|v| v.parse::<i64>().ok());
        let float = value.and_then(|v| v.parse::<f64>().ok());
        let channel = index.filter(|k| (1..=CHANNELS).contains(k));
        let on_off = |on: bool| if on { "on" } else { "off" };

        match code {
            CommandCode::GetOverview => {
                let (urms, irms, phase) = self.measurements();
                format!(
                    "freq={} Hz\ngain={} %\nsignal={}\nrelay={}\ncomm={}\ntemp={:.1} C\n\
                     urms={urms:.1} mV\nirms={irms:.1} mA\nphase={phase:.1} deg\nprocedure={}\nswf={}",
                    self.frequency,
                    self.gain,
                    on_off(self.signal),
                    self.relay_mode,
                    if self.analog { "analog" } else { "serial" },
                    self.temperature,
                    self.procedure_id(),
                    self.swf
                )
            }
            CommandCode::GetInfo => format!(
                "type=catch\nfirmware={FRAMED_VERSION}\nprotocol={FRAMED_VERSION}\nrelease=true\ninfo=sonicamp demo"
            ),
            CommandCode::GetType => "type=catch".to_string(),
            CommandCode::GetProtocol => format!("catch#{FRAMED_VERSION}#1"),
            CommandCode::ListCommands => {
                let mut aliases: Vec<&str> = self
                    .table
                    .lookups()
                    .map(|(_, lookup)| lookup.command_def.primary_alias())
                    .collect();
                aliases.sort_unstable();
                aliases.join(", ")
            }
            CommandCode::GetUpdate => format!(
                "{}#{}#{}",
                self.status_record(),
                self.relay_mode,
                if self.analog { "analog" } else { "serial" }
            ),
            CommandCode::GetStatus => self.status_record(),
            CommandCode::GetSens => {
                let (urms, irms, phase) = self.measurements();
                format!("{}#{urms:.1}#{irms:.1}#{phase:.1}", self.frequency)
            }
            CommandCode::GetUipt | CommandCode::GetPzt => {
                let (urms, irms, phase) = self.measurements();
                format!("{urms:.1}#{irms:.1}#{phase:.1}")
            }
            CommandCode::GetFrequency => format!("freq={} Hz", self.frequency),
            CommandCode::GetGain => format!("gain={} %", self.gain),
            CommandCode::GetAtf | CommandCode::GetAtk | CommandCode::GetAtt | CommandCode::GetAton => {
                match channel {
                    Some(k) => self.calibration(code, k),
                    None => "error: channel must be 1-4".to_string(),
                }
            }
            CommandCode::SetOn => {
                self.signal = true;
                "signal=on".to_string()
            }
            CommandCode::SetOff => {
                self.signal = false;
                if let Some(procedure) = self.procedure.take() {
                    self.pending_logs
                        .push(format!("LOG=WARN: {} aborted", procedure.kind));
                }
                "signal=off".to_string()
            }
            CommandCode::SetSerialMode => {
                self.analog = false;
                "comm=serial".to_string()
            }
            CommandCode::SetAnalogMode => {
                self.analog = true;
                "comm=analog".to_string()
            }
            CommandCode::SetKhz => {
                self.relay_mode = RelayMode::Khz;
                "relay=khz".to_string()
            }
            CommandCode::SetMhz => {
                self.relay_mode = RelayMode::Mhz;
                "relay=mhz".to_string()
            }
            CommandCode::SetFrequency => match int {
                Some(frequency) if frequency >= 0 => {
                    self.frequency = frequency;
                    format!("freq={frequency} Hz")
                }
                _ => "error: invalid frequency".to_string(),
            },
            CommandCode::SetGain => match int {
                Some(gain) if (0..=150).contains(&gain) => {
                    self.gain = gain;
                    format!("gain={gain} %")
                }
                _ => "error: invalid gain".to_string(),
            },
            CommandCode::SetSwf => match int {
                Some(swf) => {
                    self.swf = swf;
                    format!("swf={swf}")
                }
                None => "error: invalid swf".to_string(),
            },
            CommandCode::SetAtf | CommandCode::SetAton => match (channel, int) {
                (Some(k), Some(v)) => {
                    if code == CommandCode::SetAtf {
                        self.atf[k - 1] = v;
                        format!("atf{k}={v}")
                    } else {
                        self.aton[k - 1] = v;
                        format!("aton{k}={v}")
                    }
                }
                _ => "error: invalid channel or value".to_string(),
            },
            CommandCode::SetAtk | CommandCode::SetAtt => match (channel, float) {
                (Some(k), Some(v)) => {
                    if code == CommandCode::SetAtk {
                        self.atk[k - 1] = v;
                        format!("atk{k}={v}")
                    } else {
                        self.att[k - 1] = v;
                        format!("att{k}={v}")
                    }
                }
                _ => "error: invalid channel or value".to_string(),
            },
            CommandCode::Scan => self.start_procedure(ProcedureType::Scan, self.scan_duration, None),
            CommandCode::Tune => self.start_procedure(ProcedureType::Tune, self.tune_duration, None),
            CommandCode::Auto | CommandCode::SetAuto => self.start_procedure(
                ProcedureType::Auto,
                self.scan_duration + self.tune_duration,
                None,
            ),
            CommandCode::Wipe => self.start_procedure(ProcedureType::Wipe, Duration::from_secs(3), None),
            CommandCode::Ramp => self.start_ramp(value),
            CommandCode::SetScanGain
            | CommandCode::SetScanFRange
            | CommandCode::SetScanFStep
            | CommandCode::SetScanTStep
            | CommandCode::SetTuneFStep
            | CommandCode::SetTuneTTime
            | CommandCode::SetTuneTStep => match int {
                Some(v) => {
                    match code {
                        CommandCode::SetScanTStep => {
                            self.scan_duration = Duration::from_millis((v.max(1) * 100) as u64)
                        }
                        CommandCode::SetTuneTTime => {
                            self.tune_duration = Duration::from_millis(v.max(1) as u64)
                        }
                        _ => {}
                    }
                    let name = request_alias(
                        self.table
                            .get(code)
                            .map_or("", |lookup| lookup.command_def.primary_alias()),
                    )
                    .trim_start_matches('!');
                    format!("{name}={v}")
                }
                None => "error: invalid value".to_string(),
            },
        }
    }

    fn calibration(&self, code: CommandCode, k: usize) -> String {
        match code {
            CommandCode::GetAtf => format!("atf{k}={}", self.atf[k - 1]),
            CommandCode::GetAtk => format!("atk{k}={}", self.atk[k - 1]),
            CommandCode::GetAtt => format!("att{k}={}", self.att[k - 1]),
            _ => format!("aton{k}={}", self.aton[k - 1]),
        }
    }
}

/// Opens an in-memory link to a fresh [`DemoSonicamp`]
#[derive(Debug, Clone, Default)]
pub struct DemoConnectionFactory {
    seed: Option<u64>,
}

impl DemoConnectionFactory {
    /// Factory whose simulators are seeded from entropy
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose simulators all start from `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

#[async_trait]
impl ConnectionFactory for DemoConnectionFactory {
    async fn open(&self, baud_rate: u32) -> Result<(BoxReader, BoxWriter), ProtocolError> {
        let amp = match self.seed {
            Some(seed) => DemoSonicamp::with_seed(seed),
            None => DemoSonicamp::new(),
        };
        let (host, device) = tokio::io::duplex(8 * 1024);
        tokio::spawn(serve(device, amp));
        info!(baud_rate, "demo sonicamp connected");
        let (reader, writer) = tokio::io::split(host);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        "demo sonicamp".to_string()
    }
}

/// Answer packets until the host hangs up
async fn serve(stream: DuplexStream, mut amp: DemoSonicamp) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, SonicCodec::new(FrameProtocol::Framed));

    while let Some(frame) = frames.next().await {
        let request = match frame {
            Ok(Frame::Packet(packet)) => packet,
            Ok(Frame::Line(_)) => continue,
            Err(e) => {
                debug!(error = %e, "demo sonicamp received a bad frame");
                break;
            }
        };
        let reply = Packet::new(request.id, amp.handle(&request.payload));
        let wire = match reply.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                debug!(error = %e, "demo answer too long");
                continue;
            }
        };
        if writer.write_all(wire.as_bytes()).await.is_err() {
            break;
        }
    }
    debug!("demo sonicamp disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Field, Value};
    use pretty_assertions::assert_eq;

    fn validate(amp: &mut DemoSonicamp, request: &str) -> crate::protocol::Validation {
        let answer = amp.handle(request);
        let body: Vec<&str> = answer.lines().filter(|l| !l.starts_with("LOG=")).collect();
        let lookup = amp.command_table().find_by_request(request).unwrap();
        lookup.answer_def.validate(&body.join("\n"))
    }

    #[test]
    fn test_answers_validate_against_own_table() {
        let mut amp = DemoSonicamp::with_seed(7);
        for request in [
            "?", "?info", "?type", "?protocol", "?list_commands", "?update", "-", "?sens", "?f",
            "?g", "?uipt", "?atf1", "?atk2", "?att3", "?aton4", "!ON", "!OFF", "!SERIAL",
            "!ANALOG", "!KHZ", "!MHZ", "!f=120000", "!g=50", "!swf=3", "!atf1=100",
            "!atk1=1.5", "!att1=30.5", "!aton1=20", "!scan_gain=10", "!tune_t_time=100",
        ] {
            let validation = validate(&mut amp, request);
            assert!(validation.valid, "{request}: {:?}", validation.unknown_answers);
        }
    }

    #[test]
    fn test_frequency_setter_updates_state() {
        let mut amp = DemoSonicamp::with_seed(1);
        let validation = validate(&mut amp, "!f=250000");
        assert_eq!(
            validation.value_dict.get(&Field::Frequency),
            Some(&Value::Int(250_000))
        );
        assert_eq!(amp.handle("?f").lines().last(), Some("freq=250000 Hz"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_procedure_finishes_after_duration() {
        let mut amp = DemoSonicamp::with_seed(3);
        assert!(amp.handle("!scan").ends_with("procedure=1"));
        assert_eq!(amp.procedure_id(), 1);
        tokio::time::advance(Duration::from_secs(3)).await;
        let answer = amp.handle("-");
        assert!(answer.contains("LOG=INFO: scan finished"));
        assert_eq!(amp.procedure_id(), 0);
    }

    #[test]
    fn test_unknown_request() {
        let mut amp = DemoSonicamp::with_seed(1);
        assert!(amp.handle("!fly").ends_with("unknown command: !fly"));
    }
}
