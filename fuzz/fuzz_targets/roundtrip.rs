#![no_main]
use libfuzzer_sys::fuzz_target;
use graph_pickle::SerOptions;

// Whatever unpickles must pickle again, with every protocol.
fuzz_target!(|data: &[u8]| {
    if let Ok(value) = graph_pickle::value_from_slice(data, Default::default()) {
        for proto in 0..=graph_pickle::HIGHEST_PROTOCOL {
            let _ = graph_pickle::value_to_vec(&value, SerOptions::new().proto(proto));
        }
    }
});
