// Test file for the CORDIC polling API. Needs no wiring.

#![deny(warnings)]
#![no_std]
#![no_main]

#[cfg(test)]
#[embedded_test::tests(setup = rtt_target::rtt_init_defmt!())]
mod tests {
    use hal::{
        cordic::{Cordic, CordicConfig, CordicState, Function},
        pac::{self, CORDIC},
    };

    /// Allowed error, in Q1.31 LSBs. Precision 5 gives about 20 bits.
    const TOLERANCE: i64 = 1 << 12;

    fn q31(v: f32) -> u32 {
        (v * 2_147_483_648.) as i32 as u32
    }

    fn close(actual: u32, expected: f32) -> bool {
        let diff = actual as i32 as i64 - (expected * 2_147_483_648.) as i64;
        diff.abs() < TOLERANCE
    }

    struct State {
        cordic: Cordic<CORDIC>,
    }

    #[init]
    fn init() -> State {
        let dp = pac::Peripherals::take().unwrap();
        State {
            cordic: Cordic::new(dp.CORDIC, &dp.RCC),
        }
    }

    #[test]
    fn sine(mut state: State) {
        state
            .cordic
            .set_config(&CordicConfig {
                function: Function::Sine,
                ..Default::default()
            })
            .unwrap();

        let angles = [q31(0.), q31(0.5), q31(-0.5)];
        let mut out = [0; 3];
        state.cordic.calculate(&angles, &mut out, 10).unwrap();

        defmt::assert!(close(out[0], 0.));
        // sin(pi/2) saturates just below 1.
        defmt::assert!(close(out[1], 0.999_999_9));
        defmt::assert!(close(out[2], -1.));
        defmt::assert_eq!(state.cordic.state(), CordicState::Idle);
    }

    #[test]
    fn zero_overhead_cosine(mut state: State) {
        state.cordic.set_config(&CordicConfig::default()).unwrap();

        let angles = [q31(0.25)];
        let mut out = [0; 1];
        state
            .cordic
            .calculate_zero_overhead(&angles, &mut out)
            .unwrap();

        defmt::assert!(close(out[0], 0.707_106_8));
    }

    #[test]
    fn sqrt_rejects_high_precision(mut state: State) {
        let result = state.cordic.set_config(&CordicConfig {
            function: Function::SquareRoot,
            precision: 6,
            ..Default::default()
        });
        defmt::assert!(result.is_err());
    }
}
