#![no_main]

use libfuzzer_sys::fuzz_target;

use e2build::env::Environment;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let pairs: Vec<(&str, &str)> = input
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect();

    let mut forward = Environment::new();
    for (k, v) in &pairs {
        forward.insert(*k, *v);
    }
    let mut backward = Environment::new();
    for (k, v) in pairs.iter().rev() {
        backward.insert(*k, *v);
    }

    // Identity is a function of the mapping, not of insertion order.
    assert_eq!(forward.id(), backward.id());
    assert_eq!(forward.id().len(), 40);

    // Merging without override never changes existing entries.
    let before: Vec<(String, String)> = forward
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    forward.merge(&backward, false);
    for (k, v) in before {
        assert_eq!(forward.get(&k), Some(v.as_str()));
    }
});
