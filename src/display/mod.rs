//! Terminal output: live message echo, status lines and the pairing QR.

pub mod message;
pub mod qr;

pub use message::{
    print_connected, print_error, print_info, print_live_message, print_warning, LiveMessage,
};
pub use qr::{clear_qr_display, render_qr_code};
