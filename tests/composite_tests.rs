//! Integration tests for composite stages.

use vidpipe::config::ConfigBlock;
use vidpipe::prelude::*;

fn counter(limit: i32) -> FnSource<i32, impl FnMut() -> Emit<i32> + Send + 'static> {
    let mut n = 0;
    FnSource::new(move || {
        n += 1;
        if n <= limit { Emit::Value(n) } else { Emit::Done }
    })
}

/// `in -> stage -> out` wrapped in a composite.
fn wrap(name: &str, stage: impl Stage + 'static) -> CompositeStage {
    let mut composite = CompositeStage::new(name);
    let input = composite.add_input_pad::<i32>("in").unwrap();
    let output = composite.add_output_pad::<i32>("out").unwrap();
    let inner = composite.pipeline_mut();
    let id = inner.add("inner", stage).unwrap();
    inner.connect(input, "value", id, "input").unwrap();
    inner.connect(id, "output", output, "value").unwrap();
    composite
}

/// Like [`wrap`], over a threaded nested pipeline.
fn wrap_async(name: &str, stage: impl Stage + 'static) -> AsyncCompositeStage {
    let mut composite = AsyncCompositeStage::new(name);
    let input = composite.add_input_pad::<i32>("in").unwrap();
    let output = composite.add_output_pad::<i32>("out").unwrap();
    let inner = composite.pipeline_mut();
    let id = inner.add("inner", stage).unwrap();
    inner.connect(input, "value", id, "input").unwrap();
    inner.connect(id, "output", output, "value").unwrap();
    composite
}

fn host(composite: impl Stage + 'static, limit: i32) -> (SyncPipeline, vidpipe::stages::Collected<i32>) {
    let (sink, seen) = Collector::<i32>::new();
    let mut p = SyncPipeline::with_config("host", SyncConfig::quiet());
    let src = p.add("source", counter(limit)).unwrap();
    let sp = p.add("sp", composite).unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", sp, "in").unwrap();
    p.connect(sp, "out", dst, "value").unwrap();
    p.initialize().unwrap();
    (p, seen)
}

#[test]
fn test_composite_is_transparent() {
    let composite = wrap("triple", FnMap::new(|x: i32| Emit::Value(x * 3)));
    let (mut p, seen) = host(composite, 4);

    assert_eq!(p.run(), 5);
    assert_eq!(*seen.lock().unwrap(), vec![3, 6, 9, 12]);
}

#[test]
fn test_composites_nest() {
    let inner = wrap("add_one", FnMap::new(|x: i32| Emit::Value(x + 1)));

    let mut outer = CompositeStage::new("outer");
    let input = outer.add_input_pad::<i32>("in").unwrap();
    let output = outer.add_output_pad::<i32>("out").unwrap();
    let p = outer.pipeline_mut();
    let nested = p.add("nested", inner).unwrap();
    p.connect(input, "value", nested, "in").unwrap();
    p.connect(nested, "out", output, "value").unwrap();

    let (mut p, seen) = host(outer, 3);
    p.run();
    assert_eq!(*seen.lock().unwrap(), vec![2, 3, 4]);

    let timing = p.collect_node_timing();
    assert!(timing.contains_key("sp"));
    assert!(timing.contains_key("sp:nested"));
    assert!(timing.contains_key("sp:nested:inner"));
}

#[test]
fn test_inner_skip_surfaces_as_skip() {
    let composite = wrap(
        "odd_only",
        FnMap::new(|x: i32| if x % 2 == 1 { Emit::Value(x) } else { Emit::Skip }),
    );
    let (mut p, seen) = host(composite, 4);

    assert_eq!(p.execute(), ExecutionStatus::Success);
    assert_eq!(p.execute(), ExecutionStatus::Skip);
    assert_eq!(p.execute(), ExecutionStatus::Success);
    assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
}

#[test]
fn test_restart_absorbs_failure() {
    let mut calls = 0;
    let flaky = FnMap::new(move |x: i32| {
        calls += 1;
        if calls == 2 { Emit::Done } else { Emit::Value(x) }
    });
    let composite = wrap("flaky", flaky).with_max_restarts(1);
    let (mut p, seen) = host(composite, 4);

    assert_eq!(p.run(), 5);
    assert_eq!(*seen.lock().unwrap(), vec![1, 3, 4]);
}

#[test]
fn test_skip_tick_refills_restart_budget() {
    // Failures on ticks 2 and 4 are separated by a skipped tick, so each
    // one is the first of its run and fits a budget of one.
    let mut calls = 0;
    let flaky = FnMap::new(move |x: i32| {
        calls += 1;
        match calls {
            2 | 4 => Emit::Done,
            3 => Emit::Skip,
            _ => Emit::Value(x),
        }
    });
    let composite = wrap("flaky", flaky).with_max_restarts(1);
    let (mut p, seen) = host(composite, 5);

    assert_eq!(p.run(), 6);
    assert_eq!(*seen.lock().unwrap(), vec![1, 5]);
}

#[test]
fn test_failure_without_restart_budget() {
    let mut calls = 0;
    let flaky = FnMap::new(move |x: i32| {
        calls += 1;
        if calls == 2 { Emit::Done } else { Emit::Value(x) }
    });
    let (mut p, seen) = host(wrap("flaky", flaky), 4);

    assert_eq!(p.run(), 2);
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

/// Multiplies its input by a configurable gain.
struct Gain {
    gain: i64,
    input: Option<i32>,
    output: i32,
}

impl Stage for Gain {
    fn type_name(&self) -> &str {
        "gain"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::required::<i32>("input")]
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<i32>("output")]
    }

    fn params(&self) -> ConfigBlock {
        ConfigBlock::new().with("gain", self.gain)
    }

    fn configure(&mut self, block: &ConfigBlock) -> Result<()> {
        self.gain = block.require_i64("gain")?;
        Ok(())
    }

    fn set_input(&mut self, _port: &str, value: PortValue) -> Result<()> {
        self.input = Some(value.downcast()?);
        Ok(())
    }

    fn step(&mut self) -> ExecutionStatus {
        match self.input.take() {
            Some(x) => {
                self.output = x * self.gain as i32;
                ExecutionStatus::Success
            }
            None => ExecutionStatus::Skip,
        }
    }

    fn output(&self, _port: &str) -> Result<PortValue> {
        Ok(PortValue::new(self.output))
    }
}

#[test]
fn test_params_route_into_nested_pipeline() {
    let gain = Gain {
        gain: 1,
        input: None,
        output: 0,
    };
    let (mut p, seen) = host(wrap("amplifier", gain), 3);

    let mut params = p.params();
    assert_eq!(params.get("sp:inner:gain").and_then(|v| v.as_i64()), Some(1));
    params.set("sp:inner:gain", 5);
    p.configure(&params).unwrap();

    p.run();
    assert_eq!(*seen.lock().unwrap(), vec![5, 10, 15]);
}

// ============================================================================
// Threaded nested pipelines
// ============================================================================

#[test]
fn test_async_composite_in_async_pipeline() {
    let composite = wrap_async("double", FnMap::new(|x: i32| Emit::Value(x * 2)));
    let (sink, seen) = Collector::<i32>::new();
    let mut p = AsyncPipeline::with_config(
        "host",
        AsyncConfig::default()
            .with_edge_capacity(2)
            .with_detailed_report(false),
    );
    let src = p.add("source", counter(20)).unwrap();
    let sp = p.add("sp", composite).unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", sp, "in").unwrap();
    p.connect(sp, "out", dst, "value").unwrap();
    p.initialize().unwrap();
    p.run().unwrap();

    let expected: Vec<i32> = (1..=20).map(|x| x * 2).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    let report = p.report();
    let nested = report.node("sp").and_then(|n| n.nested.clone()).unwrap();
    assert_eq!(nested.name, "double");
    assert!(nested.node("inner").is_some());
}

#[test]
fn test_async_composite_branches_join() {
    let mut composite = AsyncCompositeStage::new("diamond");
    let input = composite.add_input_pad::<i32>("in").unwrap();
    let output = composite.add_output_pad::<i32>("out").unwrap();
    let inner = composite.pipeline_mut();
    let inc = inner.add("inc", FnMap::new(|x: i32| Emit::Value(x + 1))).unwrap();
    let tens = inner.add("tens", FnMap::new(|x: i32| Emit::Value(x * 10))).unwrap();
    let sum = inner
        .add("sum", FnCombine::new(|a: i32, b: i32| Emit::Value(a + b)))
        .unwrap();
    inner.connect(input, "value", inc, "input").unwrap();
    inner.connect(input, "value", tens, "input").unwrap();
    inner.connect(inc, "output", sum, "a").unwrap();
    inner.connect(tens, "output", sum, "b").unwrap();
    inner.connect(sum, "output", output, "value").unwrap();

    let (mut p, seen) = host(composite, 3);
    assert_eq!(p.run(), 4);
    assert_eq!(*seen.lock().unwrap(), vec![12, 23, 34]);
}

#[test]
fn test_async_composite_folds_output_pads() {
    let mut composite = AsyncCompositeStage::new("split");
    let input = composite.add_input_pad::<i32>("in").unwrap();
    let all = composite.add_output_pad::<i32>("out").unwrap();
    let small = composite.add_output_pad::<i32>("small").unwrap();
    let inner = composite.pipeline_mut();
    let gate = inner
        .add(
            "gate",
            FnMap::new(|x: i32| if x < 2 { Emit::Value(x) } else { Emit::Done }),
        )
        .unwrap();
    inner.connect(input, "value", all, "value").unwrap();
    inner.connect(input, "value", gate, "input").unwrap();
    inner.connect(gate, "output", small, "value").unwrap();

    // One failed output pad does not fail the composite.
    let (mut p, seen) = host(composite, 3);
    assert_eq!(p.execute(), ExecutionStatus::Success);
    assert_eq!(p.execute(), ExecutionStatus::Success);
    assert_eq!(p.execute(), ExecutionStatus::Success);
    assert_eq!(p.execute(), ExecutionStatus::Failure);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_async_composite_restart_absorbs_failure() {
    let mut calls = 0;
    let flaky = FnMap::new(move |x: i32| {
        calls += 1;
        if calls == 2 { Emit::Done } else { Emit::Value(x) }
    });
    let composite = wrap_async("flaky", flaky).with_max_restarts(1);
    let (mut p, seen) = host(composite, 4);

    assert_eq!(p.run(), 5);
    assert_eq!(*seen.lock().unwrap(), vec![1, 3, 4]);
}
