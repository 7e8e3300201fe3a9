#![no_main]

use libfuzzer_sys::fuzz_target;
use testhost_core::AssemblyIdentity;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // A parsed identity must survive formatting and re-parsing
        if let Ok(identity) = s.parse::<AssemblyIdentity>() {
            let reparsed: AssemblyIdentity = identity.full_name().parse().unwrap();
            assert_eq!(identity, reparsed);
        }
    }
});
