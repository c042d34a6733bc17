use std::f64::consts::PI;

use eir_core::ops::stft::sample_time;
use eir_core::{params, serialize, EdgeOpts, EirGraph, Event, GraphError, PortRef, TimeConfig, TimeUnit, Value};
use eir_runtime::{
    compare, parse_events, run, trace_equivalent, ExecOptions, ExecPlan, PlanError, RunOutcome, Trace,
};

fn ev(ts: u64, node: &str, port: &str, idx: i64, v: f64) -> Event {
    Event::new(ts, PortRef::new(node, port), v).with_idx(vec![idx])
}

fn run_graph(g: &EirGraph, events: Vec<Event>) -> RunOutcome {
    let plan = ExecPlan::build(g).unwrap();
    run(&plan, events, &ExecOptions::default()).unwrap()
}

/// Two 128-neuron populations, A -> B through a delayed edge, with noise.
fn two_populations(seed: u64) -> EirGraph {
    let mut g = EirGraph::with_time(TimeConfig::fixed_step(100).with_seed(seed));
    g.add_node(
        "pop_a",
        "lif",
        params! { "n" => 128, "tau_ms" => 10.0, "v_th" => 1.0, "noise" => 0.05 },
    )
    .unwrap();
    g.add_node(
        "pop_b",
        "lif",
        params! { "n" => 128, "tau_ms" => 12.5, "v_th" => 1.05, "noise" => 0.05 },
    )
    .unwrap();
    g.connect_with(
        "pop_a",
        "spike",
        "pop_b",
        "in",
        EdgeOpts::default().weight(0.25).delay_us(500),
    )
    .unwrap();
    g.add_probe("a", "pop_a", "spike").unwrap();
    g.add_probe("b", "pop_b", "spike").unwrap();
    g
}

fn population_drive() -> Vec<Event> {
    let mut events = Vec::new();
    for step in 0..120u64 {
        for ch in 0..128i64 {
            if (ch + step as i64) % 3 == 0 {
                events.push(ev(step * 250_000 + ch as u64 * 1_000, "pop_a", "in", ch, 0.6));
            }
        }
    }
    events
}

#[test]
fn populations_are_reproducible() {
    let g = two_populations(42);
    let first = run_graph(&g, population_drive());
    assert!(first.trace.records_for("a").count() > 0);
    assert!(first.trace.records_for("b").count() > 0);

    for _ in 0..2 {
        let again = run_graph(&g, population_drive());
        assert_eq!(again.trace, first.trace);
        assert_eq!(again.trace.to_jsonl().unwrap(), first.trace.to_jsonl().unwrap());
        assert_eq!(again.stats, first.stats);
    }
}

#[test]
fn every_trace_is_time_ordered() {
    let out = run_graph(&two_populations(42), population_drive());
    out.trace.validate().unwrap();
    // B only ever sees A's spikes half a millisecond later.
    let first_a = out.trace.records_for("a").map(|r| r.ts).min().unwrap();
    let first_b = out.trace.records_for("b").map(|r| r.ts).min().unwrap();
    assert!(first_b >= first_a + 500_000);
}

#[test]
fn zero_delay_cycle_is_rejected_but_delayed_loop_runs() {
    let mut g = EirGraph::new();
    g.add_node("x", "lif", params! {}).unwrap();
    g.add_node("y", "lif", params! {}).unwrap();
    g.connect("x", "spike", "y", "in").unwrap();
    g.connect("y", "spike", "x", "in").unwrap();
    match ExecPlan::build(&g) {
        Err(PlanError::Graph(GraphError::CycleDetected { nodes })) => assert_eq!(nodes, vec!["x", "y"]),
        other => panic!("expected a cycle, got {other:?}"),
    }

    let mut g = EirGraph::new();
    g.add_node("x", "lif", params! { "refractory_us" => 10_000 }).unwrap();
    g.add_node("y", "lif", params! {}).unwrap();
    g.connect("x", "spike", "y", "in").unwrap();
    g.connect_with("y", "spike", "x", "in", EdgeOpts::default().delay_us(1_000))
        .unwrap();
    let out = run_graph(&g, vec![ev(0, "x", "in", 0, 1.5)]);
    let ids: Vec<_> = out.trace.records().iter().map(|r| (r.probe.as_str(), r.ts)).collect();
    assert_eq!(ids, vec![("x", 0), ("y", 0)]);
}

#[test]
fn saved_graph_reproduces_the_same_trace() {
    let g = two_populations(7);
    let text = serialize::save(&g).unwrap();
    let loaded = serialize::load(&text).unwrap();
    assert_eq!(serialize::save(&loaded).unwrap(), text);
    let a = run_graph(&g, population_drive());
    let b = run_graph(&loaded, population_drive());
    assert_eq!(a.trace, b.trace);
}

#[test]
fn refractory_neuron_spikes_once() {
    let mut g = EirGraph::new();
    g.add_node("n", "lif", params! { "refractory_us" => 5_000 }).unwrap();
    let out = run_graph(&g, vec![ev(0, "n", "in", 0, 2.0), ev(1_000_000, "n", "in", 0, 2.0)]);
    assert_eq!(out.trace.len(), 1);
    assert_eq!(out.trace.records()[0].ts, 0);
}

#[test]
fn fixed_step_matches_exact_event_on_tick_aligned_input() {
    let build = |time: TimeConfig| {
        let mut g = EirGraph::with_time(time);
        g.add_node("d", "delay", params! { "delay_us" => 300 }).unwrap();
        g.add_node("n", "lif", params! { "v_th" => 0.8, "refractory_us" => 100 })
            .unwrap();
        g.connect("d", "out", "n", "in").unwrap();
        g
    };
    let events: Vec<_> = (0..20u64).map(|k| ev(k * 700_000, "d", "in", 0, 0.9)).collect();
    let golden = run_graph(&build(TimeConfig::default()), events.clone());
    let fixed_time = TimeConfig::fixed_step(100);
    let eps = fixed_time.epsilons();
    let candidate = run_graph(&build(fixed_time), events);
    let report = compare(&golden.trace, &candidate.trace, eps);
    assert!(report.passed(), "{:?}", report.first_divergence);
    assert_eq!(report.golden_count, 40);
}

#[test]
fn shifted_candidate_fails_equivalence() {
    let mut g = EirGraph::new();
    g.add_node("d", "delay", params! { "delay_us" => 200 }).unwrap();
    let golden = run_graph(&g, vec![ev(0, "d", "in", 0, 1.0)]);
    let mut shifted = Trace::new();
    for r in golden.trace.records() {
        shifted.record(&r.probe, r.ts + 150_000, r.idx.clone(), r.val.clone(), r.meta.clone());
    }
    assert!(!trace_equivalent(&golden.trace, &shifted, TimeConfig::default().epsilons()));
}

#[test]
fn fuse_detects_coincidence_within_window() {
    let fuse = || {
        let mut g = EirGraph::new();
        g.add_node("f", "fuse", params! { "window_us" => 5_000, "min_count" => 2 })
            .unwrap();
        g
    };
    let out = run_graph(&fuse(), vec![ev(0, "f", "a", 0, 1.0), ev(3_000_000, "f", "b", 0, 1.0)]);
    assert_eq!(out.trace.len(), 1);
    assert_eq!(out.trace.records()[0].ts, 3_000_000);

    let out = run_graph(&fuse(), vec![ev(0, "f", "a", 0, 1.0), ev(10_000_000, "f", "b", 0, 1.0)]);
    assert!(out.trace.is_empty());
}

#[test]
fn delay_line_from_an_input_stream() {
    let mut g = EirGraph::new();
    g.add_node("d", "delay", params! { "delay_us" => 200 }).unwrap();
    let events = parse_events(
        "{\"header\":{\"units\":{\"time\":\"us\"}}}\n{\"ts\":1000,\"node\":\"d\",\"port\":\"in\",\"idx\":[0],\"val\":0.75}\n",
        TimeUnit::Ns,
    )
    .unwrap();
    let out = run_graph(&g, events);
    assert_eq!(out.trace.len(), 1);
    let r = &out.trace.records()[0];
    assert_eq!(r.ts, 1_200_000);
    assert_eq!(r.val, Value::Scalar(0.75));
}

#[test]
fn mel_peak_follows_the_tone() {
    let sr = 16_000u32;
    let mut g = EirGraph::new();
    g.add_node(
        "stft",
        "stft",
        params! { "sample_rate" => 16_000, "win_ms" => 16, "hop_ms" => 8, "n_fft" => 256 },
    )
    .unwrap();
    g.add_node(
        "mel",
        "mel",
        params! { "sample_rate" => 16_000, "n_fft" => 256, "n_mels" => 32, "output" => "vector" },
    )
    .unwrap();
    g.connect("stft", "spec", "mel", "in").unwrap();
    g.add_probe("mel", "mel", "mel").unwrap();

    let tone: Vec<_> = (0..1_600u64)
        .map(|i| {
            let v = (2.0 * PI * 1_000.0 * i as f64 / sr as f64).sin();
            ev(sample_time(i, sr), "stft", "in", 0, v)
        })
        .collect();

    let peaks = |out: &RunOutcome| -> Vec<usize> {
        out.trace
            .records()
            .iter()
            .map(|r| {
                let bands = r.val.as_slice();
                (0..bands.len()).max_by(|&a, &b| bands[a].total_cmp(&bands[b])).unwrap()
            })
            .collect()
    };
    let a = run_graph(&g, tone.clone());
    let b = run_graph(&g, tone);
    assert_eq!(a.trace, b.trace);
    // (1600 - 256) / 128 + 1 full frames.
    assert_eq!(a.trace.len(), 11);
    assert!(peaks(&a).iter().all(|&p| p == 11), "{:?}", peaks(&a));
}

fn rect_stft(time: TimeConfig, win_ms: i64, hop_ms: i64, sample_rate: i64) -> EirGraph {
    let mut g = EirGraph::with_time(time);
    g.add_node(
        "stft",
        "stft",
        params! { "sample_rate" => sample_rate, "win_ms" => win_ms, "hop_ms" => hop_ms, "window" => "rect" },
    )
    .unwrap();
    g.add_probe("spec", "stft", "spec").unwrap();
    g
}

#[test]
fn stft_gap_is_zero_filled_in_both_modes() {
    let events = vec![ev(0, "stft", "in", 0, 1.0), ev(9_000_000, "stft", "in", 0, 2.0)];
    let exact = run_graph(&rect_stft(TimeConfig::default(), 4, 4, 1_000), events.clone());
    let ts: Vec<_> = exact.trace.records().iter().map(|r| r.ts).collect();
    assert_eq!(ts, vec![9_000_000, 9_000_000]);
    assert!((exact.trace.records()[0].val.as_slice()[0] - 1.0).abs() < 1e-12);
    assert!(exact.trace.records()[1].val.as_slice().iter().all(|m| m.abs() < 1e-12));

    let fixed_time = TimeConfig::fixed_step(100);
    let eps = fixed_time.epsilons();
    let fixed = run_graph(&rect_stft(fixed_time, 4, 4, 1_000), events);
    let report = compare(&exact.trace, &fixed.trace, eps);
    assert!(report.passed(), "{:?}", report.first_divergence);
}

#[test]
fn stft_stream_starting_late_is_framed_from_its_start() {
    let sr = 16_000u32;
    let start = 16_000u64;
    let samples: Vec<_> = (start..start + 600)
        .map(|i| ev(sample_time(i, sr), "stft", "in", 0, (i % 7) as f64 / 7.0))
        .collect();
    let exact = run_graph(&rect_stft(TimeConfig::default(), 16, 8, 16_000), samples.clone());
    let ts: Vec<_> = exact.trace.records().iter().map(|r| r.ts).collect();
    // Framing starts at 1 s; (600 - 256) / 128 + 1 full frames.
    assert_eq!(ts, vec![1_016_000_000, 1_024_000_000, 1_032_000_000]);

    let fixed_time = TimeConfig::fixed_step(125);
    let eps = fixed_time.epsilons();
    let fixed = run_graph(&rect_stft(fixed_time, 16, 8, 16_000), samples);
    let report = compare(&exact.trace, &fixed.trace, eps);
    assert!(report.passed(), "{:?}", report.first_divergence);
    assert_eq!(report.golden_count, 3);
}

#[cfg(feature = "parallel")]
#[test]
fn parallel_evaluation_matches_sequential() {
    let mut g = EirGraph::with_time(TimeConfig::default().with_seed(3));
    for i in 0..8 {
        g.add_node(&format!("n{i}"), "lif", params! { "n" => 16, "noise" => 0.1 })
            .unwrap();
        g.add_node(&format!("s{i}"), "exp_syn", params! {}).unwrap();
        g.connect(&format!("n{i}"), "spike", &format!("s{i}"), "pre").unwrap();
    }
    let events: Vec<_> = (0..200u64)
        .map(|k| ev(k * 10_000, &format!("n{}", k % 8), "in", (k % 16) as i64, 1.2))
        .collect();
    let plan = ExecPlan::build(&g).unwrap();
    let seq = run(&plan, events.clone(), &ExecOptions::default()).unwrap();
    let par = run(
        &plan,
        events,
        &ExecOptions {
            parallel: true,
            ..ExecOptions::default()
        },
    )
    .unwrap();
    assert_eq!(seq.trace, par.trace);
}
