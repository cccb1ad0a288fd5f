
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use log::{info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config;
use crate::signal::Signal;

/// A profile section whose timestamps are not observable yet: the signal
/// pair is resolved at the owning device's next synchronize.
pub(crate) struct SigProfRecord {
    pub(crate) st: Signal,
    pub(crate) en: Signal,
    pub(crate) desc: String,
    pub(crate) is_copy: bool,
    pub(crate) args: Option<BTreeMap<String, String>>,
}

/// A resolved profile section in raw device microseconds.
pub(crate) struct RawProfRecord {
    pub(crate) st: Decimal,
    pub(crate) en: Decimal,
    pub(crate) desc: String,
    pub(crate) is_copy: bool,
    pub(crate) args: Option<BTreeMap<String, String>>,
}

/// One side of a cross-queue dependency edge, in raw device microseconds.
#[derive(Clone, Debug)]
pub struct DepEndpoint {
    pub st: Decimal,
    pub en: Decimal,
    pub device: String,
    pub is_copy: bool,
}

pub(crate) struct DepProfRecord {
    pub(crate) from: DepEndpoint,
    pub(crate) to: DepEndpoint,
}

fn queue_tag(is_copy: bool) -> &'static str {
    if is_copy {
        "DMA"
    } else {
        "COMPUTE"
    }
}

/// One entry of the Chrome-trace `traceEvents` array.
#[derive(Serialize)]
struct TraceEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    ph: &'static str,
    pid: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bp: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct TraceDocument {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<TraceEvent>,
}

struct EventRecord {
    name: String,
    st: Decimal,
    en: Decimal,
    actor: String,
    subactor: &'static str,
    args: Option<BTreeMap<String, String>>,
}

struct Sink {
    events: Vec<EventRecord>,
    deps: Vec<DepProfRecord>,
    /// gpu-to-cpu diff per (device, queue-kind), registered at each
    /// device's teardown so dependency endpoints of foreign devices can be
    /// converted at final flush.
    actor_diffs: HashMap<(String, bool), Decimal>,
    path: PathBuf,
}

/// Interns actor/subactor names into pid/tid metadata entries; ids are
/// assigned from one shared counter in first-seen order.
fn ensure_actor(
    doc: &mut Vec<TraceEvent>,
    ids: &mut HashMap<(String, Option<&'static str>), usize>,
    actor: &str,
    subactor: &'static str,
) -> (usize, usize) {
    let next = ids.len();
    let pid = *ids
        .entry((actor.to_string(), None))
        .or_insert_with(|| {
            doc.push(TraceEvent {
                name: Some("process_name".to_string()),
                ph: "M",
                pid: next,
                tid: None,
                ts: None,
                dur: None,
                id: None,
                bp: None,
                args: Some(BTreeMap::from([("name".to_string(), actor.to_string())])),
            });
            next
        });
    let next = ids.len();
    let tid = *ids
        .entry((actor.to_string(), Some(subactor)))
        .or_insert_with(|| {
            doc.push(TraceEvent {
                name: Some("thread_name".to_string()),
                ph: "M",
                pid,
                tid: Some(next),
                ts: None,
                dur: None,
                id: None,
                bp: None,
                args: Some(BTreeMap::from([(
                    "name".to_string(),
                    subactor.to_string(),
                )])),
            });
            next
        });
    (pid, tid)
}

impl Sink {
    fn convert_endpoint(&self, ep: &DepEndpoint) -> f64 {
        // Viewers connect flow nodes by time, so each endpoint collapses
        // to its midpoint.
        let mid = (ep.st + ep.en) / Decimal::from(2);
        let diff = self
            .actor_diffs
            .get(&(ep.device.clone(), ep.is_copy))
            .or_else(|| self.actor_diffs.get(&(ep.device.clone(), false)))
            .copied()
            .unwrap_or(Decimal::ZERO);
        (mid + diff).to_f64().unwrap_or(0.0)
    }

    fn flush(&mut self) {
        if self.events.is_empty() && self.deps.is_empty() {
            return;
        }

        let mut doc = Vec::new();
        let mut ids = HashMap::new();

        for ev in &self.events {
            let (pid, tid) = ensure_actor(&mut doc, &mut ids, &ev.actor, ev.subactor);
            let ts = ev.st.to_f64().unwrap_or(0.0);
            let dur = (ev.en - ev.st).to_f64().unwrap_or(0.0);
            doc.push(TraceEvent {
                name: Some(ev.name.clone()),
                ph: "X",
                pid,
                tid: Some(tid),
                ts: Some(ts),
                dur: Some(dur),
                id: None,
                bp: None,
                args: ev.args.clone(),
            });
        }

        for dep in &self.deps {
            let from_ts = self.convert_endpoint(&dep.from);
            let to_ts = self.convert_endpoint(&dep.to);
            let (from_pid, from_tid) =
                ensure_actor(&mut doc, &mut ids, &dep.from.device, queue_tag(dep.from.is_copy));
            let (to_pid, to_tid) =
                ensure_actor(&mut doc, &mut ids, &dep.to.device, queue_tag(dep.to.is_copy));
            let id = doc.len();
            doc.push(TraceEvent {
                name: None,
                ph: "s",
                pid: from_pid,
                tid: Some(from_tid),
                ts: Some(from_ts),
                dur: None,
                id: Some(id),
                bp: Some("e"),
                args: None,
            });
            doc.push(TraceEvent {
                name: None,
                ph: "f",
                pid: to_pid,
                tid: Some(to_tid),
                ts: Some(to_ts),
                dur: None,
                id: Some(id),
                bp: Some("e"),
                args: None,
            });
        }

        let document = TraceDocument { trace_events: doc };
        match serde_json::to_string(&document) {
            Ok(json) => match fs::write(&self.path, json) {
                Ok(()) => info!(
                    "saved profile to {}; open it with https://ui.perfetto.dev/",
                    self.path.display()
                ),
                Err(e) => warn!("failed to write profile {}: {e}", self.path.display()),
            },
            Err(e) => warn!("failed to serialize profile: {e}"),
        }
        self.events.clear();
        self.deps.clear();
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Clonable handle to the process-wide trace sink.
///
/// Each device holds one clone; the document is serialized and written
/// exactly once, when the last clone drops.
#[derive(Clone)]
pub struct ProfileHandle(Rc<RefCell<Sink>>);

impl ProfileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Rc::new(RefCell::new(Sink {
            events: Vec::new(),
            deps: Vec::new(),
            actor_diffs: HashMap::new(),
            path: path.into(),
        })))
    }

    /// Handle wired to the process configuration; `None` when profiling is
    /// disabled. Clone the returned handle into every device.
    pub fn from_env() -> Option<Self> {
        config::profile_enabled().then(|| Self::new(config::profile_path()))
    }

    pub(crate) fn add_event(
        &self,
        name: String,
        st: Decimal,
        en: Decimal,
        actor: &str,
        is_copy: bool,
        args: Option<BTreeMap<String, String>>,
    ) {
        self.0.borrow_mut().events.push(EventRecord {
            name,
            st,
            en,
            actor: actor.to_string(),
            subactor: queue_tag(is_copy),
            args,
        });
    }

    pub(crate) fn add_dep(&self, dep: DepProfRecord) {
        self.0.borrow_mut().deps.push(dep);
    }

    pub(crate) fn register_actor(&self, actor: &str, compute_diff: Decimal, copy_diff: Option<Decimal>) {
        let mut sink = self.0.borrow_mut();
        sink.actor_diffs
            .insert((actor.to_string(), false), compute_diff);
        if let Some(copy_diff) = copy_diff {
            sink.actor_diffs.insert((actor.to_string(), true), copy_diff);
        }
    }
}
