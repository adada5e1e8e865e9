//! This library provides high-level access to STM32U5 peripherals: timers, the CORDIC
//! co-processor, DAC, the digital camera interface (DCMI), and the serial audio interface (SAI),
//! along with the GPDMA1 controller that moves their data.
//!
//! Each driver is a handle that owns its register block, and tracks a transfer state. Transfers
//! come in three flavors: blocking, interrupt-driven, and DMA. Interrupt and DMA transfers finish
//! in your ISRs: call the handle's `irq_handler`, or its `*_dma_irq_handler` from the GPDMA
//! channel's ISR. Completion and error events are reported through callbacks registered on
//! the handle.
//!
//! Please review the readme for more details, and self-tests/u575 for usage examples.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "u535")]
pub use stm32u5::stm32u535 as pac;

#[cfg(feature = "u545")]
pub use stm32u5::stm32u545 as pac;

#[cfg(feature = "u575")]
pub use stm32u5::stm32u575 as pac;

#[cfg(feature = "u585")]
pub use stm32u5::stm32u585 as pac;

#[cfg(feature = "u595")]
pub use stm32u5::stm32u595 as pac;

#[cfg(feature = "u599")]
pub use stm32u5::stm32u599 as pac;

#[cfg(feature = "u5a5")]
pub use stm32u5::stm32u5a5 as pac;

#[cfg(feature = "u5a9")]
pub use stm32u5::stm32u5a9 as pac;

// Unit tests run on the host; without a part selected, they use the U575 register map.
#[cfg(all(test, not(feature = "u5")))]
pub use stm32u5::stm32u575 as pac;

pub mod cordic;
pub mod dac;
pub mod dcmi;
pub mod dma;
pub mod error;
pub mod macros;
pub mod sai;
pub mod tick;
pub mod timer;
mod util;

pub use error::{Error, Result};

/// Used for while loops, to allow returning an error instead of hanging.
pub(crate) const MAX_ITERS: u32 = 300_000;
