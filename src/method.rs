//! The RSA capability set as a trait.
//!
//! The underlying library thinks in method tables: a key object carries
//! `{pub_enc, pub_dec, priv_enc, priv_dec, sign, verify}` and an engine may
//! override individual slots. Here that is a trait. [`LocalKey`] is the
//! library default, running every operation in-process; the proxy key
//! overrides the three private-key slots with network-routed variants and
//! delegates the rest to the local implementation.

use openssl::md::Md;
use openssl::nid::Nid;
use openssl::pkey::{HasPrivate, HasPublic, PKey};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::{Padding, Rsa};

use crate::error::Error;

/// One RSA key's operations. Private outputs are exactly [`size`] bytes;
/// callers supply at least that much output space.
///
/// [`size`]: RsaMethod::size
pub trait RsaMethod {
    /// Modulus size in bytes.
    fn size(&self) -> usize;

    fn public_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, Error>;

    fn public_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, Error>;

    fn private_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, Error>;

    fn private_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, Error>;

    /// PKCS#1 v1.5 signature over an already-computed digest. `digest` names
    /// the hash that produced `msg`; `msg` must be exactly that hash's
    /// output length.
    fn sign(&self, digest: Nid, msg: &[u8], sig: &mut [u8]) -> Result<usize, Error>;

    fn verify(&self, digest: Nid, msg: &[u8], sig: &[u8]) -> Result<bool, Error>;
}

/// Sign a digest the way `RSA_sign` does: PKCS#1 v1.5, DigestInfo derived
/// from the NID. Shared by the local method and the daemon's `sign` stub.
pub(crate) fn sign_digest<T: HasPrivate>(
    key: &Rsa<T>,
    digest: Nid,
    msg: &[u8],
    sig: &mut [u8],
) -> Result<usize, Error> {
    let md = Md::from_nid(digest).ok_or(Error::Protocol("unknown digest type"))?;
    let pkey = PKey::from_rsa(key.clone())?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.sign_init()?;
    ctx.set_rsa_padding(Padding::PKCS1)?;
    ctx.set_signature_md(md)?;
    let needed = ctx.sign(msg, None)?;
    if sig.len() < needed {
        return Err(Error::ShortBuffer { op: "sign" });
    }
    let written = ctx.sign(msg, Some(sig))?;
    Ok(written)
}

pub(crate) fn verify_digest<T: HasPublic>(
    key: &Rsa<T>,
    digest: Nid,
    msg: &[u8],
    sig: &[u8],
) -> Result<bool, Error> {
    let md = Md::from_nid(digest).ok_or(Error::Protocol("unknown digest type"))?;
    let pkey = PKey::from_rsa(key.clone())?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.verify_init()?;
    ctx.set_rsa_padding(Padding::PKCS1)?;
    ctx.set_signature_md(md)?;
    // A mangled signature surfaces as an error stack rather than a clean
    // false on some library builds; either way it is just "no".
    Ok(ctx.verify(msg, sig).unwrap_or(false))
}

/// The library-default method: every operation runs in this process against
/// a fully-materialized private key. This is what the daemon uses, and what
/// a proxy key's public half delegates to.
pub struct LocalKey {
    key: Rsa<openssl::pkey::Private>,
}

impl LocalKey {
    pub fn new(key: Rsa<openssl::pkey::Private>) -> LocalKey {
        LocalKey { key }
    }

    pub fn from_pem(pem: &[u8]) -> Result<LocalKey, Error> {
        Ok(LocalKey::new(Rsa::private_key_from_pem(pem)?))
    }

    pub fn rsa(&self) -> &Rsa<openssl::pkey::Private> {
        &self.key
    }
}

impl RsaMethod for LocalKey {
    fn size(&self) -> usize {
        self.key.size() as usize
    }

    fn public_encrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        Ok(self.key.public_encrypt(from, to, padding)?)
    }

    fn public_decrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        Ok(self.key.public_decrypt(from, to, padding)?)
    }

    fn private_encrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        Ok(self.key.private_encrypt(from, to, padding)?)
    }

    fn private_decrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        Ok(self.key.private_decrypt(from, to, padding)?)
    }

    fn sign(&self, digest: Nid, msg: &[u8], sig: &mut [u8]) -> Result<usize, Error> {
        sign_digest(&self.key, digest, msg, sig)
    }

    fn verify(&self, digest: Nid, msg: &[u8], sig: &[u8]) -> Result<bool, Error> {
        verify_digest(&self.key, digest, msg, sig)
    }
}
