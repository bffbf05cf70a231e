#![no_main]

use ingest::{parse_flow_v5, Normalizer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(flows) = parse_flow_v5(data, "fuzz") else {
        return;
    };
    let normalizer = Normalizer::new();
    for flow in flows {
        let _ = normalizer.normalize(flow);
    }
});
