use crate::hexdump::hexdump;
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use log::{debug, warn};
use md5::{Digest as _, Md5};
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use std::sync::{Arc, Mutex, Once};
use std::thread;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const TLS_HEADER_LENGTH: usize = 5;

const OP_HANDSHAKE_AGENT: u32 = 0x00000065;
const OP_HANDSHAKE_SERVER: u32 = 0x00000064;
const OP_HOST_INFO: u32 = 0x0000006f;
#[allow(dead_code)]
const OP_HEARTBEAT: u32 = 0x0000008d;

/// Crosswalk protocol handler. The outer frame mimics a TLS record
/// (content type, version, length big-endian); the inner frame is a
/// little-endian opcode/length pair, a 36-byte UUID field, and the
/// payload, AES-128-CBC encrypted once the UUID-hash handshake has
/// derived the session keys.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    server_uuid: String,
    server_hash: [u8; 16],
    server_key: [u8; 16],
    client_uuid: String,
    client_hash: [u8; 16],
    client_key: [u8; 16],
    handshake_complete: bool,
}

struct Command {
    content_type: u8,
    version: u16,
    tls_length: u16,
    opcode: u32,
    length: u32,
    uuid: [u8; 36],
    data: Vec<u8>,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                state: Mutex::new(State::default()),
            }),
            decoder: Once::new(),
        }
    }
}

impl Default for Handler {
    fn default() -> Self {
        Handler::new()
    }
}

impl crate::protocol::Handler for Handler {
    fn needs_tls(&self) -> bool {
        false
    }

    fn set_delegate(&self, delegate: Arc<dyn Delegate>) {
        self.inner.delegate.set(delegate);
    }

    fn accept(&self) {
        let uuid = Uuid::random();

        let mut state = self.inner.state.lock().unwrap();
        state.server_uuid = uuid.to_string();
        state.server_hash = uuid.hash();
        state.server_key = generate_key(state.server_hash);
    }

    fn receive_data(&self, data: &[u8]) {
        debug!("received\n{}", hexdump(data));

        let inner = Arc::clone(&self.inner);
        self.decoder.call_once(move || {
            thread::spawn(move || inner.process_data());
        });

        self.inner.queue.put(data);
    }

    fn execute(&self, _name: &str, _args: &[String]) {
        warn!("crosswalk doesn't support command execution");
    }

    fn upload(&self, _source: &str, _destination: &str) {
        warn!("crosswalk doesn't support file upload");
    }

    fn download(&self, _source: &str, _destination: &str) {
        warn!("crosswalk doesn't support file download");
    }

    fn close(&self) {
        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let header = match self.queue.get(TLS_HEADER_LENGTH) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            let content_type = header[0];
            let version = u16::from_be_bytes([header[1], header[2]]);
            let tls_length = u16::from_be_bytes([header[3], header[4]]);

            let mut data = match self.queue.get(tls_length as usize) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            {
                let state = self.state.lock().unwrap();
                if state.handshake_complete {
                    data = match aes_decrypt(&data, &state.server_key) {
                        Ok(d) => d,
                        Err(_) => {
                            self.delegate.get().close_connection();
                            return;
                        }
                    };
                }
            }

            if data.len() < 44 {
                self.delegate.get().close_connection();
                return;
            }

            let mut command = Command {
                content_type,
                version,
                tls_length,
                opcode: u32::from_le_bytes(data[0..4].try_into().unwrap()),
                length: u32::from_le_bytes(data[4..8].try_into().unwrap()),
                uuid: [0u8; 36],
                data: Vec::new(),
            };
            command.uuid.copy_from_slice(&data[8..44]);

            if command.length > 0 {
                command.data = data[44..].to_vec();
            }

            self.process_command(command);
        }
    }

    fn process_command(&self, command: Command) {
        log_command(&command);

        match command.opcode {
            OP_HANDSHAKE_AGENT => {
                if command.data.len() < 72 {
                    self.delegate.get().close_connection();
                    return;
                }

                {
                    let mut state = self.state.lock().unwrap();

                    if let Ok(uuid) = parse_uuid(&command.uuid) {
                        state.client_uuid = uuid;
                    }

                    // Only the first sixteen bytes of the 72-byte hash
                    // block feed the key schedule.
                    state.client_hash.copy_from_slice(&command.data[0..16]);
                    state.client_key = generate_key(state.client_hash);
                }

                self.send_server_handshake();

                self.state.lock().unwrap().handshake_complete = true;
            }
            OP_HOST_INFO => {
                let id = hex::encode(Sha256::digest(&command.data));
                self.delegate.get().agent_connected(&id);
            }
            _ => {}
        }
    }

    /// Reply with the server's own padded UUID hash plus that hash
    /// encrypted under a key derived from itself, proving knowledge of
    /// the key schedule.
    fn send_server_handshake(&self) {
        let server_hash = self.state.lock().unwrap().server_hash;

        let mut hash = server_hash.to_vec();
        hash.resize(72, 0x00);

        let temp_key = crypt_derive_key(&hash);
        let mut encrypted_hash = aes_encrypt(&hash, &temp_key);
        encrypted_hash.resize(144, 0x00);

        let mut data = Vec::with_capacity(hash.len() + encrypted_hash.len());
        data.extend_from_slice(&hash);
        data.extend_from_slice(&encrypted_hash);

        self.send_command(OP_HANDSHAKE_SERVER, &data);
    }

    fn send_command(&self, opcode: u32, data: &[u8]) {
        let mut state = self.state.lock().unwrap();

        let mut payload = Vec::with_capacity(44 + data.len());
        payload.extend_from_slice(&opcode.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());

        let mut uuid = state.server_uuid.as_bytes().to_vec();
        uuid.resize(36, 0x00);
        payload.extend_from_slice(&uuid);

        payload.extend_from_slice(data);

        if state.handshake_complete {
            payload = aes_encrypt(&payload, &state.client_key);
        }
        drop(state);

        // Encryption pads to the block size, so the record length is
        // taken after the fact.
        let mut buf = Vec::with_capacity(TLS_HEADER_LENGTH + payload.len());
        buf.push(0x17);
        buf.extend_from_slice(&0x301u16.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&payload);

        self.delegate.get().send_data(&buf);
    }
}

fn log_command(command: &Command) {
    debug!("Crosswalk Command");
    debug!("TLS Content Type: {}", command.content_type);
    debug!("     TLS Version: 0x{:x}", command.version);
    debug!("      TLS Length: {}", command.tls_length);
    debug!("          Opcode: 0x{:x}", command.opcode);
    debug!("          Length: {}", command.length);
    debug!("            UUID:\n{}", hexdump(&command.uuid));
    if command.length > 0 {
        debug!("            Data:\n{}", hexdump(&command.data));
    }
}

fn aes_encrypt(src: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let iv = [0u8; 16];
    Aes128CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(src)
}

fn aes_decrypt(crypt: &[u8], key: &[u8; 16]) -> Result<Vec<u8>, &'static str> {
    let iv = [0u8; 16];
    Aes128CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(crypt)
        .map_err(|_| "bad padding")
}

/// MD5 ipad/opad fold matching CryptDeriveKey on the implant side. The
/// opad digest lands in the back half of the expanded key material and
/// never survives the truncation to sixteen bytes, so only the ipad
/// half is computed.
fn crypt_derive_key(input: &[u8]) -> [u8; 16] {
    let hash = Md5::digest(input);

    let mut b0: Vec<u8> = hash.iter().map(|b| b ^ 0x36).collect();
    b0.extend_from_slice(&[0x36; 48]);

    let mut key = [0u8; 16];
    key.copy_from_slice(&Md5::digest(&b0));
    key
}

/// Derive a session key from a UUID hash: pad to 72, derive, encrypt
/// the padded hash under the derived key, pad the ciphertext to 144,
/// and derive again.
fn generate_key(hash: [u8; 16]) -> [u8; 16] {
    let mut padded = hash.to_vec();
    padded.resize(72, 0x00);
    let derived_key = crypt_derive_key(&padded);

    let mut encrypted = aes_encrypt(&padded, &derived_key);
    encrypted.resize(144, 0x00);

    crypt_derive_key(&encrypted)
}

struct Uuid([u8; 16]);

impl Uuid {
    fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40; // Version 4
        bytes[8] = (bytes[8] & 0x3f) | 0x80; // Variant is 10
        Uuid(bytes)
    }

    /// Not the standard rendering: the implant assembles the fields
    /// little-endian and mangles the final group, so the emulation has
    /// to produce the same mangled text.
    fn to_string(&self) -> String {
        let data1 = u32::from_le_bytes(self.0[0..4].try_into().unwrap());
        let data2 = u16::from_le_bytes(self.0[4..6].try_into().unwrap());
        let data3 = u16::from_le_bytes(self.0[6..8].try_into().unwrap());
        let data4 = u64::from_le_bytes(self.0[8..16].try_into().unwrap());

        format!("{data1:08X}-{data2:04X}-{data3:04X}-{data4:011X}")
    }

    fn hash(&self) -> [u8; 16] {
        let mut padded = self.to_string().into_bytes();
        padded.resize(72, 0x00);

        let digest = Md5::digest(&padded);
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest);
        out
    }
}

fn parse_uuid(input: &[u8]) -> Result<String, &'static str> {
    if input.len() != 36 {
        return Err("uuid length is not 36 bytes");
    }

    if input[8] == 0x2d && input[13] == 0x2d && input[18] == 0x2d {
        return Ok(String::from_utf8_lossy(input).to_string());
    }

    // 64-bit agents send the raw UUID base64-encoded instead.
    let data = base64::engine::general_purpose::STANDARD
        .decode(&input[..32])
        .map_err(|_| "invalid base64 uuid")?;
    if data.len() < 16 {
        return Err("decoded uuid too short");
    }

    let mut uuid = Uuid([0u8; 16]);
    uuid.0.copy_from_slice(&data[..16]);

    Ok(uuid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::RecordingDelegate;
    use crate::protocol::Handler as _;

    fn agent_frame(opcode: u32, uuid: &[u8; 36], data: &[u8], key: Option<&[u8; 16]>) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&opcode.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(uuid);
        payload.extend_from_slice(data);

        if let Some(key) = key {
            payload = aes_encrypt(&payload, key);
        }

        let mut frame = Vec::new();
        frame.push(0x17);
        frame.extend_from_slice(&0x301u16.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    // Shaped like the mangled implant form: dashes at 8, 13 and 18 only.
    fn dashed_uuid() -> [u8; 36] {
        let mut uuid = [0u8; 36];
        uuid.copy_from_slice(b"00000000-0000-0000-00000000000000000");
        uuid
    }

    #[test]
    fn test_aes_round_trip() {
        let key = [7u8; 16];
        let ct = aes_encrypt(b"crosswalk payload", &key);
        assert_eq!(ct.len() % 16, 0);
        assert_eq!(aes_decrypt(&ct, &key).unwrap(), b"crosswalk payload");
    }

    #[test]
    fn test_decrypt_garbage_fails() {
        let key = [7u8; 16];
        assert!(aes_decrypt(&[0u8; 32], &key).is_err());
    }

    #[test]
    fn test_crypt_derive_key_deterministic() {
        let k1 = crypt_derive_key(b"same input");
        let k2 = crypt_derive_key(b"same input");
        let k3 = crypt_derive_key(b"other input");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_generate_key_depends_on_hash() {
        assert_ne!(generate_key([1u8; 16]), generate_key([2u8; 16]));
    }

    #[test]
    fn test_uuid_string_shape() {
        let uuid = Uuid::random();
        let s = uuid.to_string();
        assert!(s.len() >= 30);
        assert_eq!(&s[8..9], "-");
        assert_eq!(&s[13..14], "-");
        assert_eq!(&s[18..19], "-");
    }

    #[test]
    fn test_parse_dashed_uuid_is_identity() {
        let uuid = dashed_uuid();
        let parsed = parse_uuid(&uuid).unwrap();
        assert_eq!(parsed.as_bytes(), &uuid[..]);
    }

    #[test]
    fn test_handshake_then_host_info_registers_agent() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());
        handler.accept();

        // Agent handshake: 72-byte hash block, plaintext framing.
        let mut hash_block = vec![0xabu8; 16];
        hash_block.resize(72, 0x00);
        handler.receive_data(&agent_frame(OP_HANDSHAKE_AGENT, &dashed_uuid(), &hash_block, None));

        // Server replies with its own 216-byte handshake blob.
        let sent = delegate.wait_for_sends(1);
        let reply = &sent[0];
        assert_eq!(reply[0], 0x17);
        let record_len = u16::from_be_bytes([reply[3], reply[4]]) as usize;
        assert_eq!(reply.len(), 5 + record_len);

        let opcode = u32::from_le_bytes(reply[5..9].try_into().unwrap());
        assert_eq!(opcode, OP_HANDSHAKE_SERVER);
        let length = u32::from_le_bytes(reply[9..13].try_into().unwrap());
        assert_eq!(length, 216);

        // The first 16 bytes of the reply payload are the server hash;
        // both sides derive the receive key from it.
        let mut server_hash = [0u8; 16];
        server_hash.copy_from_slice(&reply[49..65]);
        let server_key = generate_key(server_hash);

        handler.receive_data(&agent_frame(
            OP_HOST_INFO,
            &dashed_uuid(),
            b"DESKTOP-1|10.0.0.5",
            Some(&server_key),
        ));

        let agents = delegate.wait_for_agents(1);
        assert_eq!(
            agents[0],
            hex::encode(Sha256::digest(b"DESKTOP-1|10.0.0.5"))
        );
    }

    #[test]
    fn test_undecryptable_record_closes() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());
        handler.accept();

        let mut hash_block = vec![0x01u8; 16];
        hash_block.resize(72, 0x00);
        handler.receive_data(&agent_frame(OP_HANDSHAKE_AGENT, &dashed_uuid(), &hash_block, None));
        delegate.wait_for_sends(1);

        // Post-handshake frame that is not valid ciphertext.
        let mut frame = Vec::new();
        frame.push(0x17);
        frame.extend_from_slice(&0x301u16.to_be_bytes());
        frame.extend_from_slice(&7u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 7]);
        handler.receive_data(&frame);

        delegate.wait_for_close();
    }
}
