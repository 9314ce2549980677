//! SNI extraction for HTTPS passthrough routing.
//!
//! The HTTPS vhost listener never terminates TLS; it peeks at the
//! ClientHello, reads the server_name extension, routes by it, and splices
//! the buffered bytes plus the rest of the connection to the backend.

use thiserror::Error;

/// Upper bound on how many bytes we buffer while waiting for a ClientHello.
pub const MAX_CLIENT_HELLO: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("not a TLS client hello: {0}")]
    NotTls(&'static str),

    #[error("client hello exceeds {MAX_CLIENT_HELLO} bytes")]
    TooLarge,
}

/// Extract the SNI hostname from a buffered TLS ClientHello.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some(None))` for a
/// complete hello without a server_name extension.
pub fn extract_sni(buf: &[u8]) -> Result<Option<Option<String>>, SniError> {
    // TLS record header: type, version (2), length (2).
    if buf.len() < 5 {
        return need_more(buf);
    }
    if buf[0] != 0x16 {
        return Err(SniError::NotTls("record type is not handshake"));
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return need_more(buf);
    }

    let mut hello = Cursor::new(&buf[5..5 + record_len]);
    if hello.take_u8()? != 0x01 {
        return Err(SniError::NotTls("handshake is not a client hello"));
    }
    let body_len = hello.take_u24()? as usize;
    let mut body = Cursor::new(hello.take(body_len)?);

    body.take(2)?; // legacy_version
    body.take(32)?; // random
    let session_id_len = body.take_u8()? as usize;
    body.take(session_id_len)?;
    let cipher_suites_len = body.take_u16()? as usize;
    body.take(cipher_suites_len)?;
    let compression_len = body.take_u8()? as usize;
    body.take(compression_len)?;

    if body.remaining() == 0 {
        return Ok(Some(None)); // no extensions at all
    }
    let extensions_len = body.take_u16()? as usize;
    let mut extensions = Cursor::new(body.take(extensions_len)?);
    while extensions.remaining() >= 4 {
        let ext_type = extensions.take_u16()?;
        let ext_len = extensions.take_u16()? as usize;
        let ext = extensions.take(ext_len)?;
        if ext_type != 0 {
            continue; // not server_name
        }
        let mut names = Cursor::new(ext);
        let list_len = names.take_u16()? as usize;
        let mut list = Cursor::new(names.take(list_len)?);
        while list.remaining() >= 3 {
            let name_type = list.take_u8()?;
            let name_len = list.take_u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == 0 {
                let host = std::str::from_utf8(name)
                    .map_err(|_| SniError::NotTls("server name is not utf-8"))?;
                return Ok(Some(Some(host.to_ascii_lowercase())));
            }
        }
        return Ok(Some(None));
    }
    Ok(Some(None))
}

fn need_more(buf: &[u8]) -> Result<Option<Option<String>>, SniError> {
    if buf.len() >= MAX_CLIENT_HELLO {
        return Err(SniError::TooLarge);
    }
    Ok(None)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if self.remaining() < n {
            return Err(SniError::NotTls("truncated client hello"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, SniError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u24(&mut self) -> Result<u32, SniError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ClientHello carrying the given SNI.
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(host) = sni {
            let name = host.as_bytes();
            let mut ext = Vec::new();
            ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
            ext.push(0); // host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name);
            extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name ext
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extracts_sni_host() {
        let hello = client_hello(Some("Secure.Example.Com"));
        assert_eq!(
            extract_sni(&hello).unwrap(),
            Some(Some("secure.example.com".to_string()))
        );
    }

    #[test]
    fn test_incomplete_hello_needs_more() {
        let hello = client_hello(Some("secure.example.com"));
        for cut in [0, 3, 5, hello.len() - 1] {
            assert_eq!(extract_sni(&hello[..cut]).unwrap(), None, "cut at {cut}");
        }
    }

    #[test]
    fn test_hello_without_sni() {
        let hello = client_hello(None);
        assert_eq!(extract_sni(&hello).unwrap(), Some(None));
    }

    #[test]
    fn test_non_tls_rejected() {
        let err = extract_sni(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert!(matches!(err, SniError::NotTls(_)));
    }
}
