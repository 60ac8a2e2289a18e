//! One worker thread per node for the asynchronous scheduler.

use super::graph::NodeId;
use super::node::{InputValues, InputVerdict, NodeStats, StepContext, execute_stage, resolve_inputs};
use crate::edge::{BoundedEdge, EdgeRead};
use crate::observability::{NodeMetrics, span_node};
use crate::stage::{PortValue, Stage};
use crate::status::ExecutionStatus;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lock-free view of a worker's progress, readable while it runs.
#[derive(Debug, Default)]
pub(crate) struct NodeActivity {
    running: AtomicBool,
    status: AtomicU8,
}

impl NodeActivity {
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: Option<ExecutionStatus>) {
        self.status
            .store(ExecutionStatus::encode(status), Ordering::Release);
    }

    pub(crate) fn status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::decode(self.status.load(Ordering::Acquire))
    }
}

pub(crate) struct WorkerInput {
    pub edge: Arc<BoundedEdge<PortValue>>,
    pub port: Option<String>,
    pub optional: bool,
}

pub(crate) struct WorkerOutput {
    pub edge: Arc<BoundedEdge<PortValue>>,
    pub port: Option<String>,
}

/// What a worker hands back when it exits.
pub(crate) struct WorkerExit {
    pub stage: Box<dyn Stage>,
    pub stats: NodeStats,
    pub status: Option<ExecutionStatus>,
}

pub(crate) struct Worker {
    pub pipeline: String,
    pub node: NodeId,
    pub name: String,
    pub type_name: String,
    pub stage: Box<dyn Stage>,
    pub inputs: Vec<WorkerInput>,
    pub outputs: Vec<WorkerOutput>,
    pub is_output: bool,
    pub activity: Arc<NodeActivity>,
    pub stop: Arc<AtomicBool>,
    pub stats: NodeStats,
    pub metrics: NodeMetrics,
    pub done: kanal::Sender<NodeId>,
}

/// Releases both neighbours and reports completion, even if the stage
/// panics.
struct ExitGuard {
    node: NodeId,
    edges_in: Vec<Arc<BoundedEdge<PortValue>>>,
    edges_out: Vec<Arc<BoundedEdge<PortValue>>>,
    activity: Arc<NodeActivity>,
    done: kanal::Sender<NodeId>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        for edge in &self.edges_in {
            edge.close();
            edge.set_consumer_active(false);
        }
        for edge in &self.edges_out {
            edge.close();
        }
        self.activity.set_running(false);
        let _ = self.done.send(self.node);
    }
}

impl Worker {
    /// Drive the node until it fails, is stopped, or loses every consumer.
    pub(crate) fn run(mut self) -> WorkerExit {
        let span = span_node(&self.pipeline, &self.name, &self.type_name);
        let _entered = span.enter();
        let _guard = ExitGuard {
            node: self.node,
            edges_in: self.inputs.iter().map(|i| Arc::clone(&i.edge)).collect(),
            edges_out: self.outputs.iter().map(|o| Arc::clone(&o.edge)).collect(),
            activity: Arc::clone(&self.activity),
            done: self.done.clone(),
        };
        tracing::debug!("worker started");

        let mut last = None;
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let status = self.tick();
            last = Some(status);
            self.activity.set_status(last);

            if status == ExecutionStatus::Failure {
                break;
            }
            if !self.is_output
                && !self.outputs.is_empty()
                && self.outputs.iter().all(|o| o.edge.is_closed())
            {
                tracing::debug!("all consumers gone");
                break;
            }
        }

        if self.stop.load(Ordering::Acquire) {
            self.stage.cancel();
            tracing::debug!("worker cancelled");
        }
        tracing::debug!(status = ?last, steps = self.stats.steps, "worker finished");

        WorkerExit {
            stage: self.stage,
            stats: self.stats,
            status: last,
        }
    }

    fn tick(&mut self) -> ExecutionStatus {
        // Barrier: every input is read, in construction order, before the
        // node is evaluated.
        let mut reads: SmallVec<[EdgeRead<PortValue>; 4]> =
            self.inputs.iter().map(|i| i.edge.consume()).collect();

        let exhausted =
            !self.inputs.is_empty() && self.inputs.iter().all(|i| i.edge.is_exhausted());
        let required_failure = reads
            .iter()
            .zip(&self.inputs)
            .any(|(r, i)| r.status == ExecutionStatus::Failure && !i.optional);
        if !exhausted
            && !required_failure
            && reads.iter().any(|r| r.status == ExecutionStatus::Flush)
        {
            self.synchronize_flush(&mut reads);
        }

        let verdict = if exhausted {
            InputVerdict::Fail
        } else {
            resolve_inputs(
                reads
                    .iter()
                    .zip(&self.inputs)
                    .map(|(r, i)| (r.status, i.optional)),
            )
        };

        let mut values = InputValues::new();
        if verdict == InputVerdict::Step {
            for (read, input) in reads.into_iter().zip(&self.inputs) {
                if read.status != ExecutionStatus::Success {
                    continue;
                }
                if let (Some(port), Some(value)) = (&input.port, read.value) {
                    values.push((port.clone(), value));
                }
            }
        }

        let status = execute_stage(
            self.stage.as_mut(),
            verdict,
            values,
            StepContext {
                pipeline: &self.pipeline,
                node: &self.name,
                stats: &mut self.stats,
                metrics: &self.metrics,
            },
        );
        self.publish(status)
    }

    /// After a flush on one input, discard the other inputs until each of
    /// them also delivers its flush or runs dry.
    fn synchronize_flush(&self, reads: &mut [EdgeRead<PortValue>]) {
        for (read, input) in reads.iter_mut().zip(&self.inputs) {
            let mut dropped = 0usize;
            while read.status != ExecutionStatus::Flush {
                if read.status == ExecutionStatus::Failure && input.edge.is_exhausted() {
                    break;
                }
                *read = input.edge.consume();
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(edge = %input.edge.label(), dropped, "drained input up to flush");
            }
        }
    }

    /// Publish the node's status (and values, on success) to every consumer.
    fn publish(&mut self, status: ExecutionStatus) -> ExecutionStatus {
        let mut status = status;
        let mut values: SmallVec<[Option<PortValue>; 4]> = SmallVec::new();
        if status == ExecutionStatus::Success {
            for output in &self.outputs {
                let Some(port) = &output.port else {
                    values.push(None);
                    continue;
                };
                match self.stage.output(port) {
                    Ok(value) => values.push(Some(value)),
                    Err(e) => {
                        tracing::error!(port = %port, error = %e, "output transfer failed");
                        status = ExecutionStatus::Failure;
                        values.clear();
                        break;
                    }
                }
            }
        }

        for (i, output) in self.outputs.iter().enumerate() {
            let value = values.get_mut(i).and_then(Option::take);
            output.edge.publish(status, value);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{Emit, FnCombine, FnMap};
    use std::thread;
    use std::time::Duration;
    use ExecutionStatus::*;

    fn edge() -> Arc<BoundedEdge<PortValue>> {
        Arc::new(BoundedEdge::new(0))
    }

    fn worker(
        stage: Box<dyn Stage>,
        inputs: Vec<WorkerInput>,
        outputs: Vec<WorkerOutput>,
        done: kanal::Sender<NodeId>,
    ) -> Worker {
        Worker {
            pipeline: "test".into(),
            node: NodeId(daggy::NodeIndex::new(0)),
            name: "w".into(),
            type_name: stage.type_name().to_string(),
            stage,
            inputs,
            outputs,
            is_output: false,
            activity: Arc::new(NodeActivity::default()),
            stop: Arc::new(AtomicBool::new(false)),
            stats: NodeStats::default(),
            metrics: NodeMetrics::new("test", "w"),
            done,
        }
    }

    fn value(read: EdgeRead<PortValue>) -> Option<i32> {
        read.value.and_then(|v| v.downcast::<i32>().ok())
    }

    #[test]
    fn test_worker_maps_until_failure() {
        let (tx, rx) = kanal::unbounded();
        let input = edge();
        let output = edge();
        let w = worker(
            Box::new(FnMap::new(|x: i32| Emit::Value(x * 10))),
            vec![WorkerInput {
                edge: Arc::clone(&input),
                port: Some("input".into()),
                optional: false,
            }],
            vec![WorkerOutput {
                edge: Arc::clone(&output),
                port: Some("output".into()),
            }],
            tx,
        );

        input.publish(Success, Some(PortValue::new(1)));
        input.publish(Skip, None);
        input.publish(Success, Some(PortValue::new(2)));
        input.publish(Failure, None);

        let exit = thread::spawn(move || w.run()).join().unwrap();
        assert_eq!(exit.status, Some(Failure));
        assert_eq!(exit.stats.steps, 2);
        assert!(rx.recv().is_ok());

        assert_eq!(value(output.consume()), Some(10));
        assert_eq!(output.consume().status, Skip);
        assert_eq!(value(output.consume()), Some(20));
        assert_eq!(output.consume().status, Failure);
        // Incoming edges are detached on exit.
        assert!(input.is_closed());
    }

    #[test]
    fn test_flush_synchronizes_inputs() {
        let (tx, _rx) = kanal::unbounded();
        let a = edge();
        let b = edge();
        let out = edge();
        let w = worker(
            Box::new(FnCombine::new(|a: i32, b: i32| Emit::Value(a + b))),
            vec![
                WorkerInput {
                    edge: Arc::clone(&a),
                    port: Some("a".into()),
                    optional: false,
                },
                WorkerInput {
                    edge: Arc::clone(&b),
                    port: Some("b".into()),
                    optional: false,
                },
            ],
            vec![WorkerOutput {
                edge: Arc::clone(&out),
                port: Some("output".into()),
            }],
            tx,
        );

        b.publish(Success, Some(PortValue::new(20)));
        a.publish(Flush, None);
        let handle = thread::spawn(move || w.run());

        // The worker holds a's flush and drains b until b flushes too.
        thread::sleep(Duration::from_millis(30));
        b.publish(Flush, None);
        a.publish(Success, Some(PortValue::new(3)));
        b.publish(Success, Some(PortValue::new(30)));
        a.publish(Failure, None);
        b.publish(Failure, None);

        assert_eq!(out.consume().status, Flush);
        assert_eq!(value(out.consume()), Some(33));
        assert_eq!(out.consume().status, Failure);
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_flag_cancels() {
        let (tx, rx) = kanal::unbounded();
        let out = edge();
        let mut n = 0;
        let w = worker(
            Box::new(crate::stages::FnSource::new(move || {
                n += 1;
                thread::sleep(Duration::from_millis(1));
                Emit::Value(n)
            })),
            Vec::new(),
            vec![WorkerOutput {
                edge: Arc::clone(&out),
                port: Some("value".into()),
            }],
            tx,
        );
        let stop = Arc::clone(&w.stop);
        let activity = Arc::clone(&w.activity);
        let handle = thread::spawn(move || w.run());

        thread::sleep(Duration::from_millis(20));
        assert!(activity.is_running() || activity.status().is_some());
        stop.store(true, Ordering::Release);
        let exit = handle.join().unwrap();
        assert!(exit.stats.steps > 0);
        assert!(!activity.is_running());
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn test_activity_status_codec() {
        let activity = NodeActivity::default();
        assert_eq!(activity.status(), None);
        activity.set_status(Some(Skip));
        assert_eq!(activity.status(), Some(Skip));
    }
}
