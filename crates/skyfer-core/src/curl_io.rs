//! Curl multi implementation of the `HttpIo` seam: perform, messages,
//! process completed handles. Bytes land in a per-request shared buffer as
//! curl delivers them, so the slot can drain requests mid-transfer.

use anyhow::{anyhow, Result};
use curl::easy::{Easy2, Handler, WriteError};
use curl::multi::{Easy2Handle, Multi};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use crate::http::{HttpIo, HttpReq, ReqStatus};

#[derive(Default)]
struct BodyState {
    buf: Vec<u8>,
    httpstatus: u32,
    content_length: i64,
}

/// Streams response bytes into the shared per-request state.
struct BodyHandler {
    state: Rc<RefCell<BodyState>>,
}

impl Handler for BodyHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.state.borrow_mut().buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(line) = str::from_utf8(data) {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("HTTP/") {
                if let Some(code) = rest
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    let mut st = self.state.borrow_mut();
                    st.httpstatus = code;
                    st.buf.clear();
                }
            } else if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    if let Ok(n) = value.trim().parse::<i64>() {
                        self.state.borrow_mut().content_length = n;
                    }
                }
            }
        }
        true
    }
}

/// Curl-multi-backed ranged request driver.
pub struct CurlIo {
    multi: Multi,
    next_id: u64,
    handles: HashMap<u64, Easy2Handle<BodyHandler>>,
    states: HashMap<u64, Rc<RefCell<BodyState>>>,
    /// Terminal results by request id: (transport ok, HTTP status).
    done: HashMap<u64, (bool, u32)>,
}

impl CurlIo {
    pub fn new() -> Self {
        CurlIo {
            multi: Multi::new(),
            next_id: 0,
            handles: HashMap::new(),
            states: HashMap::new(),
            done: HashMap::new(),
        }
    }

    /// Block until curl has socket activity or `timeout` passes. The event
    /// loop calls this between engine steps.
    pub fn wait(&mut self, timeout: Duration) -> Result<()> {
        self.multi
            .wait(&mut [], timeout)
            .map_err(|e| anyhow!("curl multi wait: {}", e))?;
        Ok(())
    }

    pub fn active_transfers(&self) -> usize {
        self.handles.len()
    }
}

impl Default for CurlIo {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpIo for CurlIo {
    fn new_req(&mut self) -> HttpReq {
        self.next_id += 1;
        HttpReq::new(self.next_id)
    }

    fn post(&mut self, req: &mut HttpReq) -> Result<()> {
        let state = Rc::new(RefCell::new(BodyState::default()));
        let mut easy = Easy2::new(BodyHandler {
            state: Rc::clone(&state),
        });
        easy.url(&req.posturl)
            .map_err(|e| anyhow!("curl url: {}", e))?;
        easy.post(true).map_err(|e| anyhow!("curl: {}", e))?;
        easy.post_field_size(0).map_err(|e| anyhow!("curl: {}", e))?;
        easy.follow_location(true)
            .map_err(|e| anyhow!("curl: {}", e))?;
        easy.connect_timeout(Duration::from_secs(30))
            .map_err(|e| anyhow!("curl: {}", e))?;
        easy.low_speed_limit(1024)
            .map_err(|e| anyhow!("curl: {}", e))?;
        easy.low_speed_time(Duration::from_secs(60))
            .map_err(|e| anyhow!("curl: {}", e))?;
        easy.timeout(Duration::from_secs(3600))
            .map_err(|e| anyhow!("curl: {}", e))?;

        let handle = self
            .multi
            .add2(easy)
            .map_err(|e| anyhow!("curl multi add: {}", e))?;
        self.handles.insert(req.id, handle);
        self.states.insert(req.id, state);
        req.status = ReqStatus::Inflight;
        Ok(())
    }

    fn disconnect(&mut self, req: &mut HttpReq) {
        if let Some(handle) = self.handles.remove(&req.id) {
            if let Err(e) = self.multi.remove2(handle) {
                tracing::warn!("curl multi remove on disconnect: {}", e);
            }
        }
        self.states.remove(&req.id);
        self.done.remove(&req.id);
        req.in_buf.clear();
    }

    fn perform(&mut self) -> Result<()> {
        self.multi
            .perform()
            .map_err(|e| anyhow!("curl multi perform: {}", e))?;

        let mut finished: Vec<(u64, bool)> = Vec::new();
        self.multi.messages(|msg| {
            for (id, handle) in &self.handles {
                if let Some(res) = msg.result_for2(handle) {
                    finished.push((*id, res.is_ok()));
                    break;
                }
            }
        });

        for (id, transport_ok) in finished {
            let Some(handle) = self.handles.remove(&id) else {
                continue;
            };
            match self.multi.remove2(handle) {
                Ok(mut easy) => {
                    let code = easy.response_code().unwrap_or(0);
                    self.done.insert(id, (transport_ok, code));
                }
                Err(e) => {
                    tracing::warn!("curl multi remove: {}", e);
                    self.done.insert(id, (false, 0));
                }
            }
        }
        Ok(())
    }

    fn update(&mut self, req: &mut HttpReq) {
        if let Some(state) = self.states.get(&req.id) {
            let mut st = state.borrow_mut();
            if !st.buf.is_empty() {
                req.in_buf.extend_from_slice(&st.buf);
                st.buf.clear();
            }
            if st.httpstatus != 0 {
                req.httpstatus = st.httpstatus;
            }
            req.contentlength = st.content_length;
        }
        if let Some((transport_ok, code)) = self.done.remove(&req.id) {
            self.states.remove(&req.id);
            if code != 0 {
                req.httpstatus = code;
            }
            req.status = if transport_ok && (200..300).contains(&code) {
                ReqStatus::Success
            } else {
                ReqStatus::Failure
            };
        }
    }
}
