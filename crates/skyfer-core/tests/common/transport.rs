//! Scripted HTTP transport and collecting read sink for integration tests.
//!
//! Each registered script is matched against the next posted URL by prefix
//! and played back step by step on `update`, so tests control exactly when
//! bytes "arrive" and how each connection ends.

#![allow(dead_code)]

use anyhow::Result;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use skyfer_core::direct_read::ReadSink;
use skyfer_core::ds::Ds;
use skyfer_core::error::ApiError;
use skyfer_core::http::{HttpIo, HttpReq, ReqStatus};
use skyfer_core::raid::{raid_part_size, RAIDLINE, RAIDPARTS, RAIDSECTOR};

#[derive(Debug, Clone)]
pub enum Step {
    Data(Vec<u8>),
    Success(u32),
    Fail(u32),
    Hold,
}

#[derive(Default)]
pub struct ScriptedTransport {
    next_id: u64,
    scripts: Vec<(String, VecDeque<Step>)>,
    active: HashMap<u64, VecDeque<Step>>,
    pub posted: Vec<String>,
    pub disconnected: Vec<u64>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, url_prefix: &str, steps: Vec<Step>) {
        self.scripts
            .push((url_prefix.to_string(), steps.into_iter().collect()));
    }
}

impl HttpIo for ScriptedTransport {
    fn new_req(&mut self) -> HttpReq {
        self.next_id += 1;
        HttpReq::new(self.next_id)
    }

    fn post(&mut self, req: &mut HttpReq) -> Result<()> {
        self.posted.push(req.posturl.clone());
        req.status = ReqStatus::Inflight;
        if let Some(i) = self
            .scripts
            .iter()
            .position(|(p, _)| req.posturl.starts_with(p.as_str()))
        {
            let (_, steps) = self.scripts.remove(i);
            self.active.insert(req.id, steps);
        }
        Ok(())
    }

    fn disconnect(&mut self, req: &mut HttpReq) {
        self.disconnected.push(req.id);
        self.active.remove(&req.id);
        req.in_buf.clear();
    }

    fn perform(&mut self) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, req: &mut HttpReq) {
        loop {
            let step = match self.active.get_mut(&req.id).and_then(|s| s.pop_front()) {
                Some(s) => s,
                None => return,
            };
            match step {
                Step::Data(bytes) => req.in_buf.extend_from_slice(&bytes),
                Step::Success(code) => {
                    req.httpstatus = code;
                    req.status = ReqStatus::Success;
                    self.active.remove(&req.id);
                    return;
                }
                Step::Fail(code) => {
                    req.httpstatus = code;
                    req.status = ReqStatus::Failure;
                    self.active.remove(&req.id);
                    return;
                }
                Step::Hold => return,
            }
        }
    }
}

/// Everything a read sink observed, shared with the test body.
pub struct SinkState {
    pub chunks: Vec<(u64, Vec<u8>)>,
    pub failures: Vec<(ApiError, u32, Ds)>,
    pub valid: bool,
    /// Returned from on_failure as the desired retry delay.
    pub retry_delay: Ds,
}

impl Default for SinkState {
    fn default() -> Self {
        SinkState {
            chunks: Vec::new(),
            failures: Vec::new(),
            valid: true,
            retry_delay: 0,
        }
    }
}

impl SinkState {
    /// All delivered bytes, asserting offsets form one contiguous run.
    pub fn contiguous_bytes(&self, expected_start: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut next = expected_start;
        for (pos, bytes) in &self.chunks {
            assert_eq!(*pos, next, "output offsets must be contiguous");
            next = pos + bytes.len() as u64;
            out.extend_from_slice(bytes);
        }
        out
    }
}

pub struct CollectSink(pub Rc<RefCell<SinkState>>);

impl ReadSink for CollectSink {
    fn on_data(&mut self, buf: &[u8], offset: u64, _speed: u64, _mean_speed: u64) -> bool {
        self.0.borrow_mut().chunks.push((offset, buf.to_vec()));
        true
    }

    fn on_failure(&mut self, e: ApiError, retry: u32, timeleft: Ds) -> Ds {
        let mut st = self.0.borrow_mut();
        st.failures.push((e, retry, timeleft));
        st.retry_delay
    }

    fn is_valid(&self) -> bool {
        self.0.borrow().valid
    }
}

pub fn collect_sink() -> (Rc<RefCell<SinkState>>, Box<CollectSink>) {
    let state = Rc::new(RefCell::new(SinkState::default()));
    (state.clone(), Box::new(CollectSink(state)))
}

/// Split `data` into the six raid parts (part 0 = XOR parity) exactly as the
/// storage cluster would serve them.
pub fn build_raid_parts(data: &[u8]) -> [Vec<u8>; RAIDPARTS] {
    let size = data.len() as u64;
    let mut parts: [Vec<u8>; RAIDPARTS] =
        std::array::from_fn(|i| Vec::with_capacity(raid_part_size(i, size) as usize));
    let lines = (data.len() + RAIDLINE - 1) / RAIDLINE;
    for line in 0..lines {
        let mut parity = [0u8; RAIDSECTOR];
        for part in 1..RAIDPARTS {
            let start = line * RAIDLINE + (part - 1) * RAIDSECTOR;
            let mut sector = [0u8; RAIDSECTOR];
            for (k, b) in sector.iter_mut().enumerate() {
                *b = data.get(start + k).copied().unwrap_or(0);
            }
            for (p, s) in parity.iter_mut().zip(sector.iter()) {
                *p ^= *s;
            }
            parts[part].extend_from_slice(&sector);
        }
        parts[0].extend_from_slice(&parity);
    }
    for (i, part) in parts.iter_mut().enumerate() {
        part.truncate(raid_part_size(i, size) as usize);
    }
    parts
}
