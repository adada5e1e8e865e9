use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        // U535 and U545 only have one SAI. Host unit tests without a part feature use the U575.
        sai2: { any(not(feature = "u5"), feature = "u575", feature = "u585", feature = "u595", feature = "u599", feature = "u5a5", feature = "u5a9") },
        // The host build (unit tests) has no SysTick or NVIC.
        target_mcu: { target_os = "none" },
    }
}
