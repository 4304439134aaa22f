//! Wire protocol: the signed packet codec and the deposit contract scripts.

pub mod contract;
pub mod error;
pub mod packet;
