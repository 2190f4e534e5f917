#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mtproxy_checker::parser::{parse_input, ParsedInput};
use mtproxy_checker::probe::{ProbeError, Prober};
use mtproxy_checker::types::{Descriptor, ProbeTarget};
use tokio::time::{self, Instant};

/// How the scripted prober treats one server.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Answer after this many milliseconds.
    Succeed(u64),
    /// Fail after a short delay.
    Fail,
    /// Only answer after a minute, well past any deadline.
    Hang,
    /// The probe task panics.
    Panic,
}

/// In-process prober driven by a per-server script.
pub struct ScriptedProber {
    script: HashMap<String, Behavior>,
    fallback: Behavior,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    starts: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedProber {
    pub fn new(fallback: Behavior) -> Self {
        Self {
            script: HashMap::new(),
            fallback,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, server: &str, behavior: Behavior) -> Self {
        self.script.insert(server.to_string(), behavior);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<(String, Instant)> {
        self.starts.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn round_trip(&self, target: &ProbeTarget) -> Result<Duration, ProbeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.starts
            .lock()
            .unwrap()
            .push((target.server.clone(), Instant::now()));

        let behavior = self
            .script
            .get(&target.server)
            .copied()
            .unwrap_or(self.fallback);
        match behavior {
            Behavior::Succeed(ms) => {
                time::sleep(Duration::from_millis(ms)).await;
                Ok(Duration::from_millis(ms))
            }
            Behavior::Fail => {
                time::sleep(Duration::from_millis(5)).await;
                Err(ProbeError::Handshake("scripted failure".into()))
            }
            Behavior::Hang => {
                time::sleep(Duration::from_secs(60)).await;
                Ok(Duration::from_millis(1))
            }
            Behavior::Panic => panic!("scripted panic for {}", target.server),
        }
    }
}

pub fn link(server: &str) -> String {
    format!("tg://proxy?server={server}&port=443&secret=dd00112233445566778899aabbccddeeff")
}

/// Parse `n` links for servers `s0..s{n-1}`.
pub fn descriptors(n: usize) -> Vec<Descriptor> {
    let text = (0..n).map(|i| link(&format!("s{i}"))).collect::<Vec<_>>().join("\n");
    let parsed: ParsedInput = parse_input(&text);
    assert_eq!(parsed.descriptors.len(), n);
    parsed.descriptors
}

pub fn shared(prober: ScriptedProber) -> Arc<ScriptedProber> {
    Arc::new(prober)
}
