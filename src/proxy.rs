//! The parent-side proxy key.
//!
//! A [`ProxyKey`] is what the TLS stack holds instead of a private key: the
//! daemon's handle plus the public components. Public-half operations run
//! locally against the reconstructed public key; the three private-key
//! operations serialize a request over this thread's daemon connection and
//! return the primitive's result as if it had run here.

use std::sync::Arc;

use openssl::bn::BigNum;
use openssl::nid::Nid;
use openssl::pkey::Public;
use openssl::rsa::{Padding, Rsa};
use zeroize::Zeroize;

use crate::buffer::ExpandingBuffer;
use crate::conn;
use crate::error::{fatal_transport, Error};
use crate::instance::Instance;
use crate::method::{verify_digest, RsaMethod};
use crate::wire::{self, KeyHandle};

pub struct ProxyKey {
    instance: Arc<Instance>,
    handle: KeyHandle,
    public: Rsa<Public>,
}

impl ProxyKey {
    /// Reconstruct the public half from the daemon's uppercase-hex `e`/`n`.
    pub(crate) fn from_daemon_parts(
        instance: Arc<Instance>,
        handle: KeyHandle,
        e_hex: &str,
        n_hex: &str,
    ) -> Result<ProxyKey, Error> {
        let e = BigNum::from_hex_str(e_hex)?;
        let n = BigNum::from_hex_str(n_hex)?;
        Ok(ProxyKey {
            instance,
            handle,
            public: Rsa::from_public_components(n, e)?,
        })
    }

    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    pub fn public_rsa(&self) -> &Rsa<Public> {
        &self.public
    }

    /// `(e, n)` as uppercase hex, exactly as the daemon reported them.
    pub fn public_components_hex(&self) -> Result<(String, String), Error> {
        let e = self.public.e().to_hex_str()?.to_string();
        let n = self.public.n().to_hex_str()?.to_string();
        Ok((e, n))
    }

    /// Common tail of `priv_enc`/`priv_dec`: the request is already in
    /// `buf`; run the exchange and unpack `{ret, to}`.
    fn remote_crypt(
        &self,
        op: &'static str,
        buf: &mut ExpandingBuffer,
        to: &mut [u8],
    ) -> Result<usize, Error> {
        conn::round_trip(&self.instance, buf);

        let (ret, mut out) = match parse_crypt_response(buf) {
            Ok(parsed) => parsed,
            Err(e) => fatal_transport(op, &e),
        };
        if ret < 0 {
            return Err(Error::Primitive { op });
        }
        let n = ret as usize;
        if out.len() != n {
            fatal_transport(op, &Error::Protocol("output does not match result length"));
        }
        if to.len() < n {
            out.zeroize();
            return Err(Error::ShortBuffer { op });
        }
        to[..n].copy_from_slice(&out);
        out.zeroize();
        Ok(n)
    }
}

fn parse_crypt_response(buf: &mut ExpandingBuffer) -> Result<(i64, Vec<u8>), Error> {
    let ret = buf.shift_num()? as i64;
    let out = buf.shift_bytes()?;
    if !buf.is_empty() {
        return Err(Error::Protocol("trailing bytes in response"));
    }
    Ok((ret, out))
}

impl RsaMethod for ProxyKey {
    fn size(&self) -> usize {
        self.public.size() as usize
    }

    fn public_encrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        Ok(self.public.public_encrypt(from, to, padding)?)
    }

    fn public_decrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        Ok(self.public.public_decrypt(from, to, padding)?)
    }

    fn private_encrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_PRIV_ENC);
        buf.push_bytes(from);
        buf.push_num(self.handle);
        buf.push_num(padding.as_raw() as u64);
        self.remote_crypt("private_encrypt", &mut buf, to)
    }

    fn private_decrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, Error> {
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_PRIV_DEC);
        buf.push_bytes(from);
        buf.push_num(self.handle);
        buf.push_num(padding.as_raw() as u64);
        self.remote_crypt("private_decrypt", &mut buf, to)
    }

    fn sign(&self, digest: Nid, msg: &[u8], sig: &mut [u8]) -> Result<usize, Error> {
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_SIGN);
        buf.push_num(digest.as_raw() as u64);
        buf.push_bytes(msg);
        buf.push_num(self.handle);
        conn::round_trip(&self.instance, &mut buf);

        let (ret, mut out) = match parse_crypt_response(&mut buf) {
            Ok(parsed) => parsed,
            Err(e) => fatal_transport("sign", &e),
        };
        if ret != 1 {
            return Err(Error::Primitive { op: "sign" });
        }
        if sig.len() < out.len() {
            out.zeroize();
            return Err(Error::ShortBuffer { op: "sign" });
        }
        let n = out.len();
        sig[..n].copy_from_slice(&out);
        out.zeroize();
        Ok(n)
    }

    fn verify(&self, digest: Nid, msg: &[u8], sig: &[u8]) -> Result<bool, Error> {
        verify_digest(&self.public, digest, msg, sig)
    }
}
