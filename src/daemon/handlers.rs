//! Daemon-side command stubs.
//!
//! Every handler gets the inbound buffer with the command token already
//! consumed. It parses the remaining atoms, does the work, disposes the
//! inbound payload, then pushes the response atoms into the same buffer for
//! the worker to frame and send. Parse failures bubble up as errors and cost
//! the offending connection; operational failures are reported in-band.

use std::ffi::CString;
use std::fs;
use std::path::Path;

use nix::unistd::{chown, initgroups, setgid, setuid, User};
use openssl::nid::Nid;
use openssl::rsa::{Padding, Rsa};
use zeroize::Zeroize;

use crate::buffer::ExpandingBuffer;
use crate::error::Error;
use crate::method::sign_digest;
use crate::registry::KeyRegistry;
use crate::wire::{self, KeyHandle, INVALID_HANDLE};

/// Stack scratch for primitive outputs. Large enough for any modulus the
/// daemon is willing to serve; a key bigger than this is rejected, never
/// truncated.
pub(crate) const OUT_SCRATCH: usize = 4096;

/// In-band error strings are clipped so a pathological library error cannot
/// balloon a response frame.
const MAX_ERR_LEN: usize = 512;

pub(crate) struct HandlerCtx<'a> {
    pub registry: &'a KeyRegistry,
    pub tempdir: &'a Path,
    pub sock_path: &'a Path,
}

pub(crate) fn dispatch(
    cmd: &str,
    buf: &mut ExpandingBuffer,
    ctx: &HandlerCtx<'_>,
) -> Result<(), Error> {
    match cmd {
        wire::CMD_LOAD_KEY => load_key(buf, ctx.registry),
        wire::CMD_PRIV_ENC => private_crypt(buf, ctx.registry, PrivOp::Encrypt),
        wire::CMD_PRIV_DEC => private_crypt(buf, ctx.registry, PrivOp::Decrypt),
        wire::CMD_SIGN => sign(buf, ctx.registry),
        wire::CMD_SETUIDGID => setuidgid(buf, ctx),
        _ => Err(Error::Protocol("unknown command")),
    }
}

/// `load_key(path)` → `{ok, handle, e_hex, n_hex, err}`.
///
/// The only handler whose failures are in-band: a missing file or bad PEM is
/// the caller's problem to report, not a reason to drop the connection.
fn load_key(buf: &mut ExpandingBuffer, registry: &KeyRegistry) -> Result<(), Error> {
    let path = buf.shift_str()?;
    buf.dispose();

    match try_load(&path, registry) {
        Ok((handle, e_hex, n_hex)) => {
            buf.push_num(1);
            buf.push_num(handle);
            buf.push_str(&e_hex);
            buf.push_str(&n_hex);
            buf.push_str("");
        }
        Err(mut reason) => {
            log::warn!("keyshed daemon: load_key: {}", reason);
            clip(&mut reason, MAX_ERR_LEN);
            buf.push_num(0);
            buf.push_num(INVALID_HANDLE);
            buf.push_str("");
            buf.push_str("");
            buf.push_str(&reason);
        }
    }
    Ok(())
}

/// Truncate to at most `max` bytes without splitting a character.
fn clip(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

fn try_load(path: &str, registry: &KeyRegistry) -> Result<(KeyHandle, String, String), String> {
    let pem = fs::read(path).map_err(|e| format!("{}: {}", path, e))?;
    let key = Rsa::private_key_from_pem(&pem)
        .map_err(|e| format!("{}: not a valid RSA private key: {}", path, e))?;
    let e_hex = key.e().to_hex_str().map_err(|e| e.to_string())?.to_string();
    let n_hex = key.n().to_hex_str().map_err(|e| e.to_string())?.to_string();
    let handle = registry.register(key);
    Ok((handle, e_hex, n_hex))
}

#[derive(Clone, Copy)]
enum PrivOp {
    Encrypt,
    Decrypt,
}

impl PrivOp {
    fn name(self) -> &'static str {
        match self {
            PrivOp::Encrypt => "private_encrypt",
            PrivOp::Decrypt => "private_decrypt",
        }
    }
}

/// `priv_enc`/`priv_dec` → `{ret, to}`. `ret` mirrors the primitive: output
/// length on success, negative on crypto failure (with `to` empty).
fn private_crypt(
    buf: &mut ExpandingBuffer,
    registry: &KeyRegistry,
    op: PrivOp,
) -> Result<(), Error> {
    let mut from = buf.shift_bytes()?;
    let handle = buf.shift_num()?;
    let padding = Padding::from_raw(buf.shift_num()? as i32);
    buf.dispose();

    let key = registry
        .lookup(handle)
        .ok_or(Error::Protocol("no such key"))?;

    let mut scratch = [0u8; OUT_SCRATCH];
    let ret: i64 = if key.size() as usize > OUT_SCRATCH {
        log::error!(
            "keyshed daemon: key modulus of {} bytes exceeds the {} byte scratch",
            key.size(),
            OUT_SCRATCH
        );
        -1
    } else {
        let result = match op {
            PrivOp::Encrypt => key.private_encrypt(&from, &mut scratch, padding),
            PrivOp::Decrypt => key.private_decrypt(&from, &mut scratch, padding),
        };
        match result {
            Ok(n) => n as i64,
            Err(e) => {
                log::debug!("keyshed daemon: {}: {}", op.name(), e);
                -1
            }
        }
    };

    buf.push_num(ret as u64);
    if ret >= 0 {
        buf.push_bytes(&scratch[..ret as usize]);
    } else {
        buf.push_bytes(&[]);
    }
    scratch.zeroize();
    from.zeroize();
    Ok(())
}

/// `sign(type, msg, handle)` → `{ret, sig}`. `ret` is 1 on success, 0
/// otherwise; `type` is the digest NID and `msg` the precomputed digest.
fn sign(buf: &mut ExpandingBuffer, registry: &KeyRegistry) -> Result<(), Error> {
    let digest = Nid::from_raw(buf.shift_num()? as i32);
    let msg = buf.shift_bytes()?;
    let handle = buf.shift_num()?;
    buf.dispose();

    let key = registry
        .lookup(handle)
        .ok_or(Error::Protocol("no such key"))?;

    let mut scratch = [0u8; OUT_SCRATCH];
    let result = if key.size() as usize > OUT_SCRATCH {
        Err(Error::ShortBuffer { op: "sign" })
    } else {
        sign_digest(&key, digest, &msg, &mut scratch)
    };

    match result {
        Ok(n) => {
            buf.push_num(1);
            buf.push_bytes(&scratch[..n]);
        }
        Err(e) => {
            log::debug!("keyshed daemon: sign: {}", e);
            buf.push_num(0);
            buf.push_bytes(&[]);
        }
    }
    scratch.zeroize();
    Ok(())
}

/// `setuidgid(user, change_socket_ownership)` → `{ret}`.
///
/// Drops the daemon's privileges once the parent is done with setup. When
/// the socket ownership flag is set, the tempdir and socket are chowned
/// first so the (about-to-be-unprivileged) parent can still connect from new
/// threads.
fn setuidgid(buf: &mut ExpandingBuffer, ctx: &HandlerCtx<'_>) -> Result<(), Error> {
    let user = buf.shift_str()?;
    let change_socket_ownership = buf.shift_num()? != 0;
    buf.dispose();

    let ret: i64 = match drop_privileges(&user, change_socket_ownership, ctx) {
        Ok(()) => 0,
        Err(reason) => {
            log::warn!("keyshed daemon: setuidgid {:?}: {}", user, reason);
            -1
        }
    };
    buf.push_num(ret as u64);
    Ok(())
}

fn drop_privileges(
    user: &str,
    change_socket_ownership: bool,
    ctx: &HandlerCtx<'_>,
) -> Result<(), String> {
    let pw = User::from_name(user)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("unknown user {:?}", user))?;

    if change_socket_ownership {
        chown(ctx.tempdir, Some(pw.uid), Some(pw.gid))
            .map_err(|e| format!("chown {}: {}", ctx.tempdir.display(), e))?;
        chown(ctx.sock_path, Some(pw.uid), Some(pw.gid))
            .map_err(|e| format!("chown {}: {}", ctx.sock_path.display(), e))?;
    }

    let name = CString::new(user).map_err(|_| "user name contains NUL".to_string())?;
    initgroups(&name, pw.gid).map_err(|e| format!("initgroups: {}", e))?;
    setgid(pw.gid).map_err(|e| format!("setgid: {}", e))?;
    setuid(pw.uid).map_err(|e| format!("setuid: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{verify_digest, LocalKey, RsaMethod};
    use openssl::hash::{hash, MessageDigest};
    use std::io::Write;

    struct TestEnv {
        registry: KeyRegistry,
        dir: tempfile::TempDir,
    }

    impl TestEnv {
        fn new() -> TestEnv {
            TestEnv {
                registry: KeyRegistry::new(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn ctx_with<'a>(&'a self, sock_path: &'a Path) -> HandlerCtx<'a> {
            HandlerCtx {
                registry: &self.registry,
                tempdir: self.dir.path(),
                sock_path,
            }
        }

        fn write_pem(&self, key: &Rsa<openssl::pkey::Private>) -> std::path::PathBuf {
            let path = self.dir.path().join("test.pem");
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&key.private_key_to_pem().unwrap()).unwrap();
            path
        }
    }

    fn run(env: &TestEnv, buf: &mut ExpandingBuffer) -> Result<(), Error> {
        let sock = env.dir.path().join("_");
        let cmd = buf.shift_str().unwrap();
        dispatch(&cmd, buf, &env.ctx_with(&sock))
    }

    #[test]
    fn load_key_returns_handle_and_public_components() {
        let env = TestEnv::new();
        let key = Rsa::generate(2048).unwrap();
        let path = env.write_pem(&key);

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_LOAD_KEY);
        buf.push_str(path.to_str().unwrap());
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap(), 1);
        assert_eq!(buf.shift_num().unwrap(), 0);
        assert_eq!(
            buf.shift_str().unwrap(),
            key.e().to_hex_str().unwrap().to_string()
        );
        assert_eq!(
            buf.shift_str().unwrap(),
            key.n().to_hex_str().unwrap().to_string()
        );
        assert_eq!(buf.shift_str().unwrap(), "");
        assert!(buf.is_empty());
        assert_eq!(env.registry.len(), 1);
    }

    #[test]
    fn load_key_missing_file_reports_in_band() {
        let env = TestEnv::new();
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_LOAD_KEY);
        buf.push_str("/no/such/file.pem");
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap(), 0);
        assert_eq!(buf.shift_num().unwrap(), INVALID_HANDLE);
        assert_eq!(buf.shift_str().unwrap(), "");
        assert_eq!(buf.shift_str().unwrap(), "");
        let err = buf.shift_str().unwrap();
        assert!(err.contains("/no/such/file.pem"), "err was {:?}", err);
        assert!(env.registry.is_empty());
    }

    #[test]
    fn load_key_garbage_pem_reports_in_band() {
        let env = TestEnv::new();
        let path = env.dir.path().join("garbage.pem");
        std::fs::write(&path, b"this is not a key").unwrap();

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_LOAD_KEY);
        buf.push_str(path.to_str().unwrap());
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap(), 0);
        assert_eq!(buf.shift_num().unwrap(), INVALID_HANDLE);
    }

    #[test]
    fn priv_enc_output_opens_with_the_public_key() {
        let env = TestEnv::new();
        let key = Rsa::generate(2048).unwrap();
        let handle = env.registry.register(key.clone());
        let plaintext = b"client key exchange";

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_PRIV_ENC);
        buf.push_bytes(plaintext);
        buf.push_num(handle);
        buf.push_num(Padding::PKCS1.as_raw() as u64);
        run(&env, &mut buf).unwrap();

        let ret = buf.shift_num().unwrap() as i64;
        assert_eq!(ret, key.size() as i64);
        let cipher = buf.shift_bytes().unwrap();
        assert_eq!(cipher.len(), ret as usize);

        let local = LocalKey::new(key);
        let mut plain = vec![0u8; local.size()];
        let n = local
            .public_decrypt(&cipher, &mut plain, Padding::PKCS1)
            .unwrap();
        assert_eq!(&plain[..n], plaintext);
    }

    #[test]
    fn priv_dec_recovers_what_public_encrypt_sealed() {
        let env = TestEnv::new();
        let key = Rsa::generate(2048).unwrap();
        let handle = env.registry.register(key.clone());
        let local = LocalKey::new(key);

        let secret = b"48 bytes of premaster secret padding padding pad";
        let mut cipher = vec![0u8; local.size()];
        let n = local
            .public_encrypt(secret, &mut cipher, Padding::PKCS1)
            .unwrap();

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_PRIV_DEC);
        buf.push_bytes(&cipher[..n]);
        buf.push_num(handle);
        buf.push_num(Padding::PKCS1.as_raw() as u64);
        run(&env, &mut buf).unwrap();

        let ret = buf.shift_num().unwrap() as i64;
        assert_eq!(ret, secret.len() as i64);
        assert_eq!(buf.shift_bytes().unwrap(), secret.to_vec());
    }

    #[test]
    fn priv_enc_crypto_failure_is_in_band() {
        let env = TestEnv::new();
        let key = Rsa::generate(2048).unwrap();
        let handle = env.registry.register(key);

        // Input longer than the modulus cannot be padded.
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_PRIV_ENC);
        buf.push_bytes(&vec![0u8; 4000]);
        buf.push_num(handle);
        buf.push_num(Padding::PKCS1.as_raw() as u64);
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap() as i64, -1);
        assert_eq!(buf.shift_bytes().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn unknown_handle_drops_the_connection() {
        let env = TestEnv::new();
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_SIGN);
        buf.push_num(Nid::SHA256.as_raw() as u64);
        buf.push_bytes(&[0u8; 32]);
        buf.push_num(7);
        assert!(matches!(run(&env, &mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_command_drops_the_connection() {
        let env = TestEnv::new();
        let mut buf = ExpandingBuffer::new();
        buf.push_str("reload_all_keys");
        assert!(matches!(run(&env, &mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn sign_stub_matches_local_sign() {
        let env = TestEnv::new();
        let key = Rsa::generate(2048).unwrap();
        let handle = env.registry.register(key.clone());
        let digest = hash(MessageDigest::sha256(), b"certificate verify").unwrap();

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_SIGN);
        buf.push_num(Nid::SHA256.as_raw() as u64);
        buf.push_bytes(&digest);
        buf.push_num(handle);
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap(), 1);
        let sig = buf.shift_bytes().unwrap();

        // PKCS#1 v1.5 is deterministic: the stub and a local sign agree.
        let local = LocalKey::new(key.clone());
        let mut expected = vec![0u8; local.size()];
        let n = local.sign(Nid::SHA256, &digest, &mut expected).unwrap();
        assert_eq!(sig, expected[..n].to_vec());
        assert!(verify_digest(&key, Nid::SHA256, &digest, &sig).unwrap());
    }

    #[test]
    fn sign_with_bogus_digest_type_is_in_band() {
        let env = TestEnv::new();
        let handle = env.registry.register(Rsa::generate(2048).unwrap());

        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_SIGN);
        buf.push_num(0);
        buf.push_bytes(&[0u8; 32]);
        buf.push_num(handle);
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap(), 0);
        assert_eq!(buf.shift_bytes().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn setuidgid_unknown_user_is_in_band() {
        let env = TestEnv::new();
        let mut buf = ExpandingBuffer::new();
        buf.push_str(wire::CMD_SETUIDGID);
        buf.push_str("no-such-user-keyshed-test");
        buf.push_num(0);
        run(&env, &mut buf).unwrap();

        assert_eq!(buf.shift_num().unwrap() as i64, -1);
        assert!(buf.is_empty());
    }
}
