#![no_main]

use libfuzzer_sys::fuzz_target;

use e2build::transport::ServerUrl;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(url) = ServerUrl::parse(input) {
        // Formatting a parsed URL must parse back to the same value.
        let reparsed = ServerUrl::parse(&url.to_string()).expect("round trip");
        assert_eq!(reparsed, url);
    }
});
