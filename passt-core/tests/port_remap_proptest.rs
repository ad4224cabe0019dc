use passt_core::config::PortMap;
use proptest::prelude::*;

proptest! {
    /// Property #7: for every forward delta `d` at port `p`,
    /// `rdelta[p+d] = PORTS - d`, constructed correctly, must validate,
    /// and forward/reverse must round-trip back to the original port.
    #[test]
    fn symmetric_delta_round_trips(port in any::<u16>(), raw_delta in -1000i32..1000i32) {
        let mut map = PortMap::default();
        let translated = (port as i64 + raw_delta as i64).rem_euclid(65536) as u16;
        if translated == port {
            return Ok(());
        }
        map.delta.insert(port, raw_delta);
        map.rdelta.insert(translated, -raw_delta);
        prop_assert!(map.validate().is_ok());
        prop_assert_eq!(map.reverse(map.forward(port)), port);
    }
}
