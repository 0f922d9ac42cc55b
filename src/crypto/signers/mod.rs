pub mod awskms;
pub mod inmemory;
pub mod pkcs11;
