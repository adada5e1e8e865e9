// Test file for DAC channel output. Writes data holding registers, and reads back the output
// register (DOR). Needs VDDA powered; nothing else is wired.

#![deny(warnings)]
#![no_std]
#![no_main]

#[cfg(test)]
#[embedded_test::tests(setup = rtt_target::rtt_init_defmt!())]
mod tests {
    use hal::{
        dac::{Alignment, ChannelConfig, ChannelState, Dac, DacChannel},
        pac::{self, DAC1},
    };

    struct State {
        dac: Dac<DAC1>,
    }

    #[init]
    fn init() -> State {
        let dp = pac::Peripherals::take().unwrap();
        State {
            dac: Dac::new(dp.DAC1, &dp.RCC),
        }
    }

    #[test]
    fn right_aligned_12_bit(mut state: State) {
        let ch = DacChannel::Ch1;
        state
            .dac
            .set_config_channel(ch, &ChannelConfig::default())
            .unwrap();
        state.dac.start_channel(ch).unwrap();
        defmt::assert_eq!(state.dac.channel_state(ch), ChannelState::Active);

        state.dac.set_channel_data(ch, 0x0ABC).unwrap();
        cortex_m::asm::delay(100);
        defmt::assert_eq!(state.dac.channel_data(ch), 0x0ABC);

        state.dac.stop_channel(ch).unwrap();
    }

    #[test]
    fn left_aligned_goes_to_the_same_output(mut state: State) {
        let ch = DacChannel::Ch2;
        state
            .dac
            .set_config_channel(
                ch,
                &ChannelConfig {
                    alignment: Alignment::L12,
                    ..Default::default()
                },
            )
            .unwrap();
        state.dac.start_channel(ch).unwrap();

        state.dac.set_channel_data(ch, 0x5550).unwrap();
        cortex_m::asm::delay(100);
        defmt::assert_eq!(state.dac.channel_data(ch), 0x555);
    }
}
