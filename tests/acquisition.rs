//! End-to-end acquisition scenarios driven through the simulated scope.

use std::cell::RefCell;
use std::rc::Rc;

use siglent_sds_rs::models;
use siglent_sds_rs::session::{AnalogPacket, LogicPacket, SessionSink};
use siglent_sds_rs::sim::SimulatedScope;
use siglent_sds_rs::{AcquisitionEngine, AcquisitionError, DataSource, TickStatus};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    FrameBegin,
    FrameEnd,
    Analog(AnalogPacket),
    Logic(LogicPacket),
    End,
}

/// Cloneable sink that records every packet; clones share the event list.
#[derive(Clone, Default)]
struct Recorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Flattened analog samples for one zero-based channel, in emit order.
    fn analog_samples(&self, channel: usize) -> Vec<f32> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Analog(p)
                    if p.channel == siglent_sds_rs::ChannelId::Analog(channel) =>
                {
                    Some(p.samples.clone())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn count(&self, matcher: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| matcher(e)).count()
    }
}

impl SessionSink for Recorder {
    fn send_frame_begin(&mut self) {
        self.events.borrow_mut().push(Event::FrameBegin);
    }

    fn send_frame_end(&mut self) {
        self.events.borrow_mut().push(Event::FrameEnd);
    }

    fn send_analog(&mut self, packet: AnalogPacket) {
        self.events.borrow_mut().push(Event::Analog(packet));
    }

    fn send_logic(&mut self, packet: LogicPacket) {
        self.events.borrow_mut().push(Event::Logic(packet));
    }

    fn send_end(&mut self) {
        self.events.borrow_mut().push(Event::End);
    }
}

fn engine_for(scope: &SimulatedScope, model: &'static models::Model, sink: &Recorder) -> AcquisitionEngine {
    AcquisitionEngine::new(model, Box::new(scope.clone()), Box::new(sink.clone()))
}

fn run_to_done(engine: &mut AcquisitionEngine) {
    // Generous bound; every scenario finishes in far fewer ticks.
    for _ in 0..100_000 {
        match engine.tick().expect("tick failed") {
            TickStatus::NeedIo => {}
            TickStatus::Done => return,
        }
    }
    panic!("engine never reported Done");
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "sample count mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() < 1e-6,
            "sample {i}: got {a}, expected {e}"
        );
    }
}

#[test]
fn eseries_screen_single_frame_decodes_exact_volts() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_analog_payload(
        0,
        vec![
            0x01, 0x02, 0xFC, 0xFD, 0x00, 0x00, 0x7F, 0x80, 0x81, 0xFF, 0x19, 0xE7, 0x64, 0x9C,
            0x32, 0xCE,
        ],
    );

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    run_to_done(&mut engine);

    assert_close(
        &sink.analog_samples(0),
        &[
            0.04, 0.08, -0.16, -0.12, 0.0, 0.0, 5.08, -5.12, -5.08, -0.04, 1.0, -1.0, 4.0, -4.0,
            2.0, -2.0,
        ],
    );
    let events = sink.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], Event::FrameBegin);
    assert!(matches!(events[1], Event::Analog(_)));
    assert_eq!(events[2], Event::FrameEnd);
    assert_eq!(events[3], Event::End);
    assert!(!engine.is_running());
}

#[test]
fn eseries_history_discovers_frames_and_closes_history() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    // One recognisable sample per recorded frame: 1 V, 2 V, 3 V.
    scope.set_history(vec![
        vec![Some(vec![0x19]), None, None, None],
        vec![Some(vec![0x32]), None, None, None],
        vec![Some(vec![0x4B]), None, None, None],
    ]);
    // The scope is still running when we attach, so history must be closed
    // again; it stops as soon as acquisition is frozen.
    scope.script_trmd(&["RUN"]);
    scope.set_trigger_mode("STOP");

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(0, DataSource::History).unwrap();
    run_to_done(&mut engine);

    assert_eq!(sink.count(|e| *e == Event::FrameBegin), 3);
    assert_eq!(sink.count(|e| *e == Event::FrameEnd), 3);
    assert_close(&sink.analog_samples(0), &[1.0, 2.0, 3.0]);

    let sent = scope.sent();
    assert!(sent.iter().any(|c| c == ":HSMD ON"));
    assert!(sent.iter().any(|c| c == ":FRAM 1"));
    assert!(sent.iter().any(|c| c == ":FRAM 2"));
    assert!(sent.iter().any(|c| c == ":FRAM 3"));
    assert_eq!(sent.last().map(String::as_str), Some(":HSMD OFF"));
}

#[test]
fn eseries_history_leaves_history_open_when_already_stopped() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_history(vec![vec![Some(vec![0x19]), None, None, None]]);
    // Already stopped and already in history mode: the cursor is forced to
    // the end instead of toggling the mode, and `:HSMD OFF` is never sent.
    scope.set_trigger_mode("STOP");
    scope.set_history_mode(true);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(0, DataSource::History).unwrap();
    run_to_done(&mut engine);

    let sent = scope.sent();
    assert!(sent.iter().any(|c| c == ":FRAM 10000000"));
    assert!(!sent.iter().any(|c| c == ":HSMD ON"));
    assert!(!sent.iter().any(|c| c == ":HSMD OFF"));
}

#[test]
fn empty_waveform_retries_then_succeeds() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_analog_payload(0, vec![0x19, 0x32, 0x4B]);
    scope.inject_empty_fetches(2);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    run_to_done(&mut engine);

    assert_close(&sink.analog_samples(0), &[1.0, 2.0, 3.0]);
    let fetches = scope
        .sent()
        .iter()
        .filter(|c| *c == "C1:WF? ALL")
        .count();
    assert_eq!(fetches, 3, "one initial fetch plus two retries");
}

#[test]
fn empty_waveform_abandons_channel_after_retry_budget() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_channel(1, true, 1.0, 0.0);
    scope.set_analog_payload(0, vec![0x19]);
    scope.set_analog_payload(1, vec![0x32]);
    // Initial fetch plus all five retries of C1 come back empty.
    scope.inject_empty_fetches(6);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    run_to_done(&mut engine);

    assert!(sink.analog_samples(0).is_empty(), "abandoned channel emits nothing");
    assert_close(&sink.analog_samples(1), &[2.0]);
    assert_eq!(
        scope.sent().iter().filter(|c| *c == "C1:WF? ALL").count(),
        6
    );
    assert_eq!(sink.count(|e| *e == Event::FrameBegin), 1);
    assert_eq!(sink.count(|e| *e == Event::FrameEnd), 1);
}

#[test]
fn midblock_stall_resumes_and_conserves_samples() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    let payload: Vec<u8> = (0..65_536u32).map(|k| (k % 251) as u8).collect();
    scope.set_analog_payload(0, payload.clone());
    // USBTMC refill stall after 60 KiB of payload (plus the header).
    scope.inject_stall_after(363 + 61_440);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    run_to_done(&mut engine);

    let samples = sink.analog_samples(0);
    assert_eq!(samples.len(), payload.len());
    // Spot-check decoding across the stall boundary.
    for &i in &[0usize, 61_439, 61_440, 65_535] {
        let expected = payload[i] as i8 as f32 / 25.0;
        assert!((samples[i] - expected).abs() < 1e-6, "sample {i}");
    }
}

#[test]
fn trigger_wait_timeout_tears_down() {
    let model = models::lookup("SDS1102CML").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    // The trigger bit never comes up.
    scope.script_inr(&[], 0);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();

    let err = loop {
        match engine.tick() {
            Ok(TickStatus::NeedIo) => {}
            Ok(TickStatus::Done) => panic!("expected a timeout"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, AcquisitionError::Timeout(_)));
    assert_eq!(
        sink.events(),
        vec![Event::FrameBegin, Event::FrameEnd, Event::End]
    );
    assert!(!engine.is_running());
}

#[test]
fn digital_bulk_fetch_transposes_low_and_high_banks() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, false, 1.0, 0.0);
    scope.set_logic_analyzer(true, 8);
    scope.set_digital_line(0, true);
    scope.set_digital_line(9, true);
    scope.set_digital_payload(0, vec![0xA5]);
    scope.set_digital_payload(9, vec![0x0F]);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    run_to_done(&mut engine);

    let logic: Vec<LogicPacket> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Logic(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(logic.len(), 1);
    assert_eq!(logic[0].unit_size, 2);
    assert_eq!(
        logic[0].data,
        vec![
            0x01, 0x02, 0x00, 0x02, 0x01, 0x02, 0x00, 0x02, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x01, 0x00
        ]
    );
    let sent = scope.sent();
    assert!(sent.iter().any(|c| c == "D0:WF? DAT2"));
    assert!(sent.iter().any(|c| c == "D9:WF? DAT2"));
}

#[test]
fn spo_screen_emits_channels_in_order_across_frames() {
    let model = models::lookup("SDS2304X").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_channel(2, true, 0.5, 0.0);
    scope.set_analog_payload(0, vec![0x19; 100]);
    scope.set_analog_payload(2, vec![0x32; 100]);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(2, DataSource::Screen).unwrap();
    run_to_done(&mut engine);

    let shape: Vec<&'static str> = sink
        .events()
        .iter()
        .map(|e| match e {
            Event::FrameBegin => "begin",
            Event::Analog(p) if p.channel == siglent_sds_rs::ChannelId::Analog(0) => "c1",
            Event::Analog(_) => "c3",
            Event::Logic(_) => "logic",
            Event::FrameEnd => "end",
            Event::End => "eof",
        })
        .collect();
    assert_eq!(
        shape,
        vec!["begin", "c1", "c3", "end", "begin", "c1", "c3", "end", "eof"]
    );
    // Sample conservation: every block's full data_length arrives, each frame.
    assert_eq!(sink.analog_samples(0).len(), 200);
    assert_eq!(sink.analog_samples(2).len(), 200);
}

#[test]
fn spo_history_adopts_recorded_frame_total() {
    let model = models::lookup("SDS2304X").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_history(vec![
        vec![Some(vec![0x19]), None, None, None],
        vec![Some(vec![0x32]), None, None, None],
    ]);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(0, DataSource::History).unwrap();
    run_to_done(&mut engine);

    assert_eq!(sink.count(|e| *e == Event::FrameBegin), 2);
    assert_close(&sink.analog_samples(0), &[1.0, 2.0]);
    let sent = scope.sent();
    assert!(sent.iter().any(|c| c == "FPAR?"));
    assert!(sent.iter().any(|c| c == ":FRAM 1"));
    assert!(sent.iter().any(|c| c == ":FRAM 2"));
}

#[test]
fn config_queries_follow_the_documented_order() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);
    scope.set_logic_analyzer(true, 8);
    scope.set_digital_line(0, true);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    engine.stop_acquisition();

    let mut expected: Vec<String> = Vec::new();
    for i in 1..=4 {
        expected.push(format!("C{i}:TRA?"));
    }
    expected.push("DI:SW?".into());
    for i in 0..16 {
        expected.push(format!("D{i}:TRA?"));
    }
    expected.push("TDIV?".into());
    for i in 1..=4 {
        expected.push(format!("C{i}:ATTN?"));
    }
    for i in 1..=4 {
        expected.push(format!("C{i}:VDIV?"));
        expected.push(format!("C{i}:OFST?"));
    }
    for i in 1..=4 {
        expected.push(format!("C{i}:CPL?"));
    }
    expected.push("TRSE?".into());
    expected.push("C1:TRSL?".into());
    expected.push("C1:TRLV?".into());
    expected.push("SANU? C1".into());
    expected.push("SANU? D0".into());

    let sent = scope.sent();
    assert!(sent.len() >= expected.len());
    assert_eq!(&sent[..expected.len()], expected.as_slice());
}

#[test]
fn short_trigger_select_reply_fails_config_read() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_trigger_select_reply("EDGE,SR");

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    let err = engine
        .start_acquisition(1, DataSource::Screen)
        .expect_err("config refresh must fail");
    assert!(matches!(err, AcquisitionError::ConfigRead(_)));
    assert!(sink.events().is_empty(), "nothing may be emitted before arming");
}

#[test]
fn stop_acquisition_is_idempotent() {
    let model = models::lookup("SDS1204X-E").unwrap();
    let scope = SimulatedScope::new(model);
    scope.set_channel(0, true, 1.0, 0.0);

    let sink = Recorder::default();
    let mut engine = engine_for(&scope, model, &sink);
    engine.start_acquisition(1, DataSource::Screen).unwrap();
    engine.tick().unwrap();
    engine.stop_acquisition();
    engine.stop_acquisition();

    assert_eq!(
        sink.events(),
        vec![Event::FrameBegin, Event::FrameEnd, Event::End]
    );
    assert_eq!(engine.tick().unwrap(), TickStatus::Done);
}
