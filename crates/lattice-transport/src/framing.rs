//! Length-prefixed encrypted framing.
//!
//! After key agreement every unit on the wire is one frame: a 4-byte
//! big-endian ciphertext length followed by the AEAD ciphertext. Each
//! direction seals with its own monotonic nonce counter, so frames must be
//! read in the exact order they were written. Pre-handshake traffic is
//! fixed-width and unencrypted; it never goes through this module.

use lattice_crypto::{NonceCounter, SessionCipher, TAG_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Seal `payload` and write it as one length-prefixed frame.
pub async fn write_frame<S>(
    stream: &mut S,
    cipher: &SessionCipher,
    counter: &NonceCounter,
    payload: &[u8],
) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let sealed = cipher.seal(counter.next(), payload)?;
    let len = u32::try_from(sealed.len()).map_err(|_| TransportError::FrameTooLarge {
        len: sealed.len(),
        max: u32::MAX as usize,
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&sealed).await?;
    Ok(())
}

/// Read one frame, enforce the size cap, and open it.
///
/// The cap applies to the advertised ciphertext length before any bytes of
/// the frame body are read, so an oversized advertisement costs nothing.
pub async fn read_frame<S>(
    stream: &mut S,
    cipher: &SessionCipher,
    counter: &NonceCounter,
    max_len: usize,
) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len.saturating_add(TAG_SIZE) {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut sealed = vec![0u8; len];
    stream.read_exact(&mut sealed).await?;
    Ok(cipher.open(counter.next(), &sealed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use lattice_crypto::derive_shared_key;
    use rand::rngs::OsRng;

    fn cipher_pair() -> (SessionCipher, SessionCipher) {
        let a = SigningKey::generate(&mut OsRng);
        let b = SigningKey::generate(&mut OsRng);
        let key_a = derive_shared_key(&a, &b.verifying_key()).unwrap();
        let key_b = derive_shared_key(&b, &a.verifying_key()).unwrap();
        (SessionCipher::new(&key_a), SessionCipher::new(&key_b))
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (tx_cipher, rx_cipher) = cipher_pair();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let tx_ctr = NonceCounter::new();
        let rx_ctr = NonceCounter::new();

        write_frame(&mut a, &tx_cipher, &tx_ctr, b"first").await.unwrap();
        write_frame(&mut a, &tx_cipher, &tx_ctr, b"second").await.unwrap();

        let one = read_frame(&mut b, &rx_cipher, &rx_ctr, 1024).await.unwrap();
        let two = read_frame(&mut b, &rx_cipher, &rx_ctr, 1024).await.unwrap();
        assert_eq!(one, b"first");
        assert_eq!(two, b"second");
    }

    #[tokio::test]
    async fn oversized_advertisement_is_rejected() {
        let (_, rx_cipher) = cipher_pair();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let rx_ctr = NonceCounter::new();

        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b, &rx_cipher, &rx_ctr, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn out_of_order_read_fails_authentication() {
        let (tx_cipher, rx_cipher) = cipher_pair();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let tx_ctr = NonceCounter::new();
        let rx_ctr = NonceCounter::new();
        rx_ctr.next(); // reader is one frame ahead

        write_frame(&mut a, &tx_cipher, &tx_ctr, b"frame").await.unwrap();
        let err = read_frame(&mut b, &rx_cipher, &rx_ctr, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Crypto(lattice_crypto::CryptoError::Authentication)
        ));
    }
}
