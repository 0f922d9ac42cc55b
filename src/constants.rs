//! Various crate-wide constants.

//------------ Environment Variables ----------------------------------------

/// The environment variable that overrides the default log level.
pub const KEYCUSTODY_ENV_LOG_LEVEL: &str = "KEYCUSTODY_LOG_LEVEL";

/// The environment variable naming the PKCS#11 library used by the
/// SoftHSM backed tests.
pub const KEYCUSTODY_ENV_PKCS11_LIB: &str = "KEYCUSTODY_PKCS11_LIB";

/// The environment variable naming the token label used by the SoftHSM
/// backed tests.
pub const KEYCUSTODY_ENV_PKCS11_TOKEN: &str = "KEYCUSTODY_PKCS11_TOKEN";

/// The environment variable holding the user PIN used by the SoftHSM
/// backed tests.
pub const KEYCUSTODY_ENV_PKCS11_PIN: &str = "KEYCUSTODY_PKCS11_PIN";


//------------ Sessions -----------------------------------------------------

/// The default capacity of the per slot session pool.
///
/// A borrower only ever waits on the native module, never on the pool,
/// unless more than this many sessions are checked out at the same time.
/// Returning a session to a pool that already holds this many idle
/// sessions blocks until another borrower takes one.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// The token attribute that overrides [`DEFAULT_MAX_SESSIONS`].
pub const ATTR_MAX_SESSIONS: &str = "MaxSessions";


//------------ Keys ---------------------------------------------------------

/// RSA keys with a modulus shorter than this are refused.
pub const MIN_RSA_KEY_BITS: u32 = 2048;

/// The public exponent used for all generated RSA keys.
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// The number of random bytes in a generated key id.
pub const KEY_ID_RANDOM_BYTES: usize = 16;

/// The number of random bytes prefixed to a generated key label.
pub const KEY_LABEL_RANDOM_BYTES: usize = 4;

/// The prefix of a PIN that refers to a file holding the actual PIN.
pub const PIN_FILE_PREFIX: &str = "file:";

/// The URI scheme of key references and token locators.
pub const PKCS11_URI_SCHEME: &str = "pkcs11";
