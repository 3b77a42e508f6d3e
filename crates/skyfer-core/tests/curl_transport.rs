//! Integration test: real curl-multi transport against a local server that
//! speaks the ranged-POST protocol.

mod common;

use std::time::{Duration, Instant};

use common::transport::collect_sink;
use skyfer_core::config::EngineConfig;
use skyfer_core::curl_io::CurlIo;
use skyfer_core::direct_read::NodeKey;
use skyfer_core::engine::Engine;
use skyfer_core::record::NodeHandle;

#[test]
fn non_raid_read_over_curl_delivers_the_range() {
    let body: Vec<u8> = (0u8..100).cycle().take(64 * 1024).collect();
    let base = common::post_server::start(body.clone());

    let mut cfg = EngineConfig::default();
    cfg.min_streaming_rate = 0; // no watchdog in a timing-sensitive test
    let mut eng = Engine::new(cfg);
    let mut io = CurlIo::new();

    let key = NodeKey {
        handle: NodeHandle::new(21),
        private: true,
    };
    let (state, sink) = collect_sink();
    let (offset, count) = (1000u64, 50_000u64);
    eng.enqueue_read(key.handle, true, body.len() as u64, offset, count, 1, sink, 0);

    eng.exec(&mut io, 0, 0).unwrap();
    eng.drn_cmdresult(key, Ok((vec![base], body.len() as u64)), &mut io, 0);

    let start = Instant::now();
    loop {
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_secs(30),
            "read did not finish in time; got {} bytes",
            state
                .borrow()
                .chunks
                .iter()
                .map(|(_, b)| b.len())
                .sum::<usize>()
        );
        let now_ms = elapsed.as_millis() as u64;
        eng.exec(&mut io, now_ms / 100, now_ms).unwrap();
        if eng.nodes.is_empty() {
            break;
        }
        io.wait(Duration::from_millis(20)).unwrap();
    }

    let st = state.borrow();
    let bytes = st.contiguous_bytes(offset);
    assert_eq!(bytes.len() as u64, count);
    assert_eq!(bytes, &body[offset as usize..(offset + count) as usize]);
    assert!(st.failures.is_empty());
}
