#![no_main]

use libfuzzer_sys::fuzz_target;

use e2build::transport::{format_server_location, parse_server_location};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok((server, location)) = parse_server_location(input) {
        assert!(!server.is_empty());
        assert!(!location.starts_with('/'));
        assert!(!location.split('/').any(|part| part == ".."));
        let (s, l) =
            parse_server_location(&format_server_location(&server, &location)).expect("round trip");
        assert_eq!((s, l), (server, location));
    }
});
