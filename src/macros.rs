//! Syntax helpers for sharing driver handles with interrupt handlers, and for NVIC setup.
//! Handles live in `critical_section::Mutex<RefCell<Option<T>>>` globals; an ISR borrows
//! one, and calls its `irq_handler` or `*_dma_irq_handler`.

/// A driver handle shared with interrupt handlers. Declare these with `make_globals!`.
pub type Global<T> = critical_section::Mutex<core::cell::RefCell<Option<T>>>;

/// Borrows one or more globals made with `make_globals!`, from inside a critical section. Binds
/// each to a local `&mut`, or returns from the enclosing function if any hasn't been set yet.
///
/// Example, in a DMA channel ISR:
/// ```rust,ignore
/// critical_section::with(|cs| {
///     access_globals!([(DAC, dac), (TIMER, timer)], cs);
///     dac.dma_irq_handler(DacChannel::Ch1);
/// });
/// ```
#[macro_export]
macro_rules! access_globals {
    ([$(($NAME_GLOBAL:ident, $name_local:ident)),* $(,)?], $cs:expr) => {
        $(
            let mut $name_local = $NAME_GLOBAL.borrow($cs).borrow_mut();
            let Some($name_local) = $name_local.as_mut() else {
                return;
            };
        )*
    };
}

/// `access_globals!` for a single handle.
///
/// Example: `access_global!(SAI_A, sai, cs)`
#[macro_export]
macro_rules! access_global {
    ($NAME_GLOBAL:ident, $name_local:ident, $cs:expr) => {
        $crate::access_globals!([($NAME_GLOBAL, $name_local)], $cs);
    };
}

/// Syntax helper for setting global variables of the form `Mutex<RefCell<Option>>>`.
/// eg in interrupt handlers. Ideal for non-copy-type variables that can't be initialized
/// immediatiately.
///
/// Example: `make_globals!(
///     (CORDIC, Cordic<CORDIC>),
///     (SAI_A, Sai<SAI1>),
/// )`
#[macro_export]
macro_rules! make_globals {
    ($(($NAME:ident, $type:ty)),+ $(,)?) => {
        $(
            static $NAME: $crate::macros::Global<$type> =
                ::critical_section::Mutex::new(core::cell::RefCell::new(None));
        )+
    };
}

/// Syntax helper for setting global variables of the form `Mutex<Cell<>>>`.
/// eg in interrupt handlers. Ideal for copy-type variables.
///
/// Example: `make_simple_globals!(
///     (FRAMES_CAPTURED, u32, 0),
///     (DAC_LEVEL, u16, 2_048),
/// )`
#[macro_export]
macro_rules! make_simple_globals {
    ($(($NAME:ident, $type:ty, $val:expr)),+ $(,)?) => {
        $(
            static $NAME: ::critical_section::Mutex<core::cell::Cell<$type>> = ::critical_section::Mutex::new(core::cell::Cell::new($val));
        )+
    };
}

/// Initialize one or more globals inside a critical section.
///
/// Usage:
/// ```rust,ignore
/// init_globals!(
///     (CORDIC, cordic),
///     (SAI_A, sai_a),
/// );
/// ```
#[macro_export]
macro_rules! init_globals {
    ($(($NAME:ident, $val:expr)),* $(,)?) => {
        ::critical_section::with(|cs| {
            $(
                $NAME.borrow(cs).replace(Some($val));
            )*
        });
    };
}

/// Automates Cortex-M NVIC setup. The second value is NVIC priority; lower
/// is higher priority. Interrupt names are variants of `pac::Interrupt`. Example use:
/// setup_nvic!([
///     (GPDMA1_CH0, 2),
///     (SAI1, 3),
///     (TIM2, 6),
/// ], cp);
#[macro_export]
macro_rules! setup_nvic {
    (
        [ $( ($int:ident, $prio:expr) ),* $(,)? ],
        $cp:ident
    ) => {
        unsafe {
            $(
                cortex_m::peripheral::NVIC::unmask($crate::pac::Interrupt::$int);
            )*
            $(
                $cp.NVIC.set_priority($crate::pac::Interrupt::$int, $prio);
            )*
        }
    };
}
