//! This minimal example computes a few sines on the CORDIC co-processor, and times them with a
//! basic timer. It demonstrates project structure, printing text to the console, driving the
//! HAL tick from SysTick, and polling transfers.

#![deny(warnings)]
#![no_std]
#![no_main]

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m_rt::{entry, exception};
use hal::{
    cordic::{Cordic, CordicConfig, Function},
    pac,
    tick,
    timer::{Timer, TimerConfig},
};

// Import the panic handler
use panic_probe as _;

/// The U5 comes out of reset on MSIS, at 4MHz.
const HCLK: u32 = 4_000_000;

/// Convert a value in [-1, 1) to Q1.31.
fn q31(v: f32) -> u32 {
    (v * 2_147_483_648.) as i32 as u32
}

fn from_q31(v: u32) -> f32 {
    v as i32 as f32 / 2_147_483_648.
}

// This marks the entrypoint of our application.

#[entry]
fn main() -> ! {
    rtt_target::rtt_init_defmt!();
    // Set up CPU peripherals
    let mut cp = cortex_m::Peripherals::take().unwrap();
    // Set up microcontroller peripherals
    let dp = pac::Peripherals::take().unwrap();

    defmt::println!("Hello, world!");

    // A 1kHz SysTick drives the HAL's timeouts.
    cp.SYST.set_clock_source(SystClkSource::Core);
    cp.SYST.set_reload(HCLK / 1_000 - 1);
    cp.SYST.clear_current();
    cp.SYST.enable_interrupt();
    cp.SYST.enable_counter();

    let mut cordic = Cordic::new(dp.CORDIC, &dp.RCC);
    cordic
        .set_config(&CordicConfig {
            function: Function::Sine,
            ..Default::default()
        })
        .unwrap();

    // Counts microseconds.
    let mut timer = Timer::new_tim6(
        dp.TIM6,
        &TimerConfig {
            prescaler: (HCLK / 1_000_000 - 1) as u16,
            ..Default::default()
        },
        HCLK,
        &dp.RCC,
    )
    .unwrap();
    timer.start().unwrap();

    // Angles are in units of pi. The modulus argument defaults to 1.
    let angles = [q31(0.), q31(1. / 6.), q31(0.5), q31(-0.25)];
    let mut sines = [0; 4];

    let start = timer.counter();
    cordic.calculate(&angles, &mut sines, 10).unwrap();
    let elapsed = timer.counter().wrapping_sub(start) & 0xFFFF;

    for (angle, sine) in angles.iter().zip(sines) {
        defmt::println!("sin({}π) = {}", from_q31(*angle), from_q31(sine));
    }
    defmt::println!("4 sines took {}µs", elapsed);

    loop {
        tick::delay_ms(1_000);
        defmt::debug!("Tick: {}", tick::get_tick());
    }
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
