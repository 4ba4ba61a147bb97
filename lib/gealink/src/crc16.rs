//! CRC-16 variant used on the bus: the CCITT polynomial `0x1021` with an
//! initial value of `0x1021`, no reflection and no final xor. Receivers
//! feed the received CRC bytes through the same update and require a zero
//! residue.

use crc::{Algorithm, Crc};

pub const SEED: u16 = 0x1021;

pub const ALGORITHM: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: SEED,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x5E86,
    residue: 0x0000,
};

const CRC16: Crc<u16> = Crc::<u16>::new(&ALGORITHM);

/// Folds a single byte into a running CRC.
#[inline]
pub fn byte(crc: u16, byte: u8) -> u16 {
    block(crc, &[byte])
}

/// Folds a block of bytes into a running CRC.
#[inline]
pub fn block(crc: u16, bytes: &[u8]) -> u16 {
    let mut digest = CRC16.digest_with_initial(crc);
    digest.update(bytes);
    digest.finalize()
}
