#![no_main]

use ingest::{parse_flow_json, parse_host_events, parse_packet_summaries, Normalizer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let normalizer = Normalizer::new();
    for flows in [
        parse_flow_json(data, "fuzz"),
        parse_packet_summaries(data, "fuzz"),
        parse_host_events(data, "fuzz"),
    ]
    .into_iter()
    .flatten()
    {
        for flow in flows {
            let _ = normalizer.normalize(flow);
        }
    }
});
