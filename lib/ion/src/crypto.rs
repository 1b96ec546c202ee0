use ctor::ctor;
use libsodium_sys;

/// Size of Curve25519 public keys, secret keys and precomputed shared secrets.
pub const KEY_SIZE: usize = 32;
/// Size of a `crypto_box` nonce.
pub const NONCE_SIZE: usize = 24;
/// Zero padding prepended to a plaintext before sealing.
pub const ZERO_PAD: usize = 32;
/// Zero padding prepended to a ciphertext before opening.
pub const BOX_ZERO_PAD: usize = 16;
/// Size of the Poly1305 authenticator carried by every box.
pub const MAC_SIZE: usize = ZERO_PAD - BOX_ZERO_PAD;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Explicit initialization for callers that want a checkable result. Safe to
/// call more than once.
#[inline]
pub fn init() -> bool {
    unsafe { libsodium_sys::sodium_init() >= 0 }
}

/// Generates a fresh Curve25519 keypair, returned as `(public, secret)`.
#[inline]
pub fn box_keypair() -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let mut public = [0u8; KEY_SIZE];
    let mut secret = [0u8; KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_box_keypair(public.as_mut_ptr() as *mut _, secret.as_mut_ptr() as *mut _);
    }

    (public, secret)
}

/// Derives the public key matching a secret key.
#[inline]
pub fn scalarmult_base(secret: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut public = [0u8; KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr() as *mut _, secret.as_ptr() as *const _);
    }

    public
}

/// Precomputes the shared secret for the `afternm` fast path.
#[inline]
pub fn box_beforenm(shared: &mut [u8; KEY_SIZE], public: &[u8; KEY_SIZE], secret: &[u8; KEY_SIZE]) -> bool {
    unsafe {
        libsodium_sys::crypto_box_beforenm(
            shared.as_mut_ptr() as *mut _,
            public.as_ptr() as *const _,
            secret.as_ptr() as *const _,
        ) == 0
    }
}

/// Seals a padded message into a padded cipher buffer using the recipient's
/// public key and the sender's secret key. Both slices carry the NaCl
/// padding: the first 32 bytes of `message` must be zero, and the first 16
/// bytes of `cipher` come back zero. The function will fail if the slice
/// sizes do not match.
#[inline]
pub fn box_seal(
    cipher: &mut [u8],
    message: &[u8],
    nonce: &[u8; NONCE_SIZE],
    public: &[u8; KEY_SIZE],
    secret: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != message.len() || message.len() < ZERO_PAD {
        panic!(
            "Seal: cipher length ({}) must equal message length ({}) and cover the padding",
            cipher.len(),
            message.len()
        )
    }

    unsafe {
        libsodium_sys::crypto_box(
            cipher.as_mut_ptr() as *mut _,
            message.as_ptr() as *const _,
            message.len() as u64,
            nonce.as_ptr() as *const _,
            public.as_ptr() as *const _,
            secret.as_ptr() as *const _,
        ) == 0
    }
}

/// Opens a padded cipher buffer in place. The first 16 bytes of `buffer`
/// must be zero on entry; on success the first 32 bytes are zero and the
/// plaintext follows them.
#[inline]
pub fn box_open_inplace(
    buffer: &mut [u8],
    nonce: &[u8; NONCE_SIZE],
    public: &[u8; KEY_SIZE],
    secret: &[u8; KEY_SIZE],
) -> bool {
    if buffer.len() < ZERO_PAD {
        panic!("Open: buffer length ({}) must cover the padding", buffer.len())
    }

    unsafe {
        let data = buffer.as_mut_ptr();

        libsodium_sys::crypto_box_open(
            data as *mut _,
            data as *const _,
            buffer.len() as u64,
            nonce.as_ptr() as *const _,
            public.as_ptr() as *const _,
            secret.as_ptr() as *const _,
        ) == 0
    }
}

/// Seals a padded buffer in place under a precomputed shared secret. The
/// first 32 bytes of `buffer` must be zero on entry.
#[inline]
pub fn seal_afternm_inplace(buffer: &mut [u8], nonce: &[u8; NONCE_SIZE], shared: &[u8; KEY_SIZE]) -> bool {
    if buffer.len() < ZERO_PAD {
        panic!("Seal: buffer length ({}) must cover the padding", buffer.len())
    }

    unsafe {
        let data = buffer.as_mut_ptr();

        libsodium_sys::crypto_box_afternm(
            data as *mut _,
            data as *const _,
            buffer.len() as u64,
            nonce.as_ptr() as *const _,
            shared.as_ptr() as *const _,
        ) == 0
    }
}

/// Opens a padded buffer in place under a precomputed shared secret. The
/// first 16 bytes of `buffer` must be zero on entry.
#[inline]
pub fn open_afternm_inplace(buffer: &mut [u8], nonce: &[u8; NONCE_SIZE], shared: &[u8; KEY_SIZE]) -> bool {
    if buffer.len() < ZERO_PAD {
        panic!("Open: buffer length ({}) must cover the padding", buffer.len())
    }

    unsafe {
        let data = buffer.as_mut_ptr();

        libsodium_sys::crypto_box_open_afternm(
            data as *mut _,
            data as *const _,
            buffer.len() as u64,
            nonce.as_ptr() as *const _,
            shared.as_ptr() as *const _,
        ) == 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Wipes the provided buffer in a way the optimizer cannot elide.
#[inline]
pub fn memzero(buffer: &mut [u8]) {
    unsafe {
        libsodium_sys::sodium_memzero(buffer.as_mut_ptr() as *mut ::std::ffi::c_void, buffer.len());
    }
}
