//! Transmit half of the UART contract. Received bytes and send-complete
//! notifications travel the other way, as calls into the framer's
//! interrupt-context entry points (`on_byte_received`, `on_send_complete`).
//!
//! Single-wire hardware is half-duplex: the device sees every byte it
//! drives reflected back through `on_byte_received`.

pub trait Uart {
    fn send(&mut self, byte: u8);
}
