#![no_main]

use libfuzzer_sys::fuzz_target;

use e2build::version::ReleaseId;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(id) = ReleaseId::parse(input) {
        // Whatever parses must round-trip.
        let reparsed = ReleaseId::parse(&id.format()).expect("round trip");
        assert_eq!(reparsed, id);
    }
});
