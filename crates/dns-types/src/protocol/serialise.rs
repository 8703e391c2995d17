//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.
//!
//! Domain names are compressed as a pointer is cheaper than most
//! labels: the first time a suffix of a name is written, its offset
//! is remembered in a [`WritableBuffer`]; every later occurrence of
//! that same suffix is replaced by a two-byte `0xC000`-tagged
//! pointer rather than being written out again.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

/// Buffer sizes tried, in order, when serialising a message.  A
/// bigger buffer is only attempted after a smaller one overflows, so
/// the common case (a small UDP response) does the minimum amount of
/// work.
const ENCODE_BUFFER_SIZES: [usize; 4] = [512, 8192 + 2, 16384 + 2, 65536 + 2];

impl Message {
    /// Serialise this message to the wire format, retrying with
    /// successively larger buffers if the message does not fit.
    ///
    /// # Errors
    ///
    /// If the message does not fit even in the largest attempted
    /// buffer, or if a section counter overflows a `u16`.
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut last_err = Error::MessageTooLarge;
        for size in ENCODE_BUFFER_SIZES {
            let mut buffer = WritableBuffer::with_capacity(size);
            match self.serialise(&mut buffer) {
                Ok(()) => return Ok(buffer.octets),
                Err(Error::BufferOverflow) => {
                    last_err = Error::MessageTooLarge;
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed) or the buffer overflows its
    /// fixed capacity.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer)?;
        buffer.write_u16(qdcount)?;
        buffer.write_u16(ancount)?;
        buffer.write_u16(nscount)?;
        buffer.write_u16(arcount)?;

        for question in &self.questions {
            question.serialise(buffer)?;
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let flag_z = if self.z { HEADER_MASK_Z } else { 0 };
        let flag_ad = if self.authenticated_data {
            HEADER_MASK_AD
        } else {
            0
        };
        let flag_cd = if self.checking_disabled {
            HEADER_MASK_CD
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id)?;
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd)?;
        buffer.write_u8(flag_ra | flag_z | flag_ad | flag_cd | field_rcode)?;
        Ok(())
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true)?;
        self.qtype.serialise(buffer)?;
        self.qclass.serialise(buffer)?;
        Ok(())
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long, or the buffer overflows.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true)?;
        self.rtype_with_data.rtype().serialise(buffer)?;
        self.rclass.serialise(buffer)?;
        buffer.write_u32(self.ttl)?;

        // filled in below, once we know how much RDATA was written
        let rdlength_index = buffer.index();
        buffer.write_u16(0)?;

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets())?,
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, false)?,
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, false)?,
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false)?;
                rname.serialise(buffer, false)?;
                buffer.write_u32(*serial)?;
                buffer.write_u32(*refresh)?;
                buffer.write_u32(*retry)?;
                buffer.write_u32(*expire)?;
                buffer.write_u32(*minimum)?;
            }
            RecordTypeWithData::WKS {
                address,
                protocol,
                ports,
            } => {
                buffer.write_octets(&address.octets())?;
                buffer.write_u8(*protocol)?;
                buffer.write_octets(ports)?;
            }
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, false)?,
            RecordTypeWithData::HINFO { cpu, os } => {
                cpu.serialise(buffer)?;
                os.serialise(buffer)?;
            }
            RecordTypeWithData::MINFO { rmailbx, emailbx } => {
                rmailbx.serialise(buffer, false)?;
                emailbx.serialise(buffer, false)?;
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference)?;
                exchange.serialise(buffer, false)?;
            }
            RecordTypeWithData::TXT { strings } => {
                for s in strings {
                    s.serialise(buffer)?;
                }
            }
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets())?,
            RecordTypeWithData::Unimplemented { octets, .. } => buffer.write_octets(octets)?,
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Writes the name one suffix at a time: at each step, a pointer
    /// is emitted if the current suffix is already memoised; else one
    /// label is written, the current offset is memoised for that
    /// suffix, and the walk recurses on the remaining, shorter
    /// suffix. This is what lets `["www.cnn.com.", "cnn.com."]` share
    /// the `cnn.com` suffix rather than only ever matching two
    /// byte-identical whole names.
    ///
    /// Every suffix is memoised regardless of `compress`, so a
    /// `compress: false` name (used for RDATA domain names, which are
    /// never themselves written as a pointer) still offers its bytes
    /// up as a target for names written after it.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) -> Result<(), Error> {
        let mut offset = 0;
        loop {
            let suffix_labels = &self.labels[offset..];
            if suffix_labels.len() == 1 && suffix_labels[0].is_empty() {
                return buffer.write_u8(0);
            }

            let suffix = DomainName::from_labels(suffix_labels.to_vec());

            if compress {
                if let Some(ptr) = suffix.as_ref().and_then(|s| buffer.name_pointer(s)) {
                    return buffer.write_u16(ptr);
                }
            }

            if let Some(suffix) = &suffix {
                buffer.memoise_name(suffix);
            }

            let label = &suffix_labels[0];
            buffer.write_u8(label.len())?;
            buffer.write_octets(label.octets())?;
            offset += 1;
        }
    }
}

impl CharacterString {
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        buffer.write_u8(self.len())?;
        buffer.write_octets(self.octets())
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        buffer.write_u16(self.into())
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        buffer.write_u16(self.into())
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        buffer.write_u16(self.into())
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        buffer.write_u16(self.into())
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
    /// The fixed-size buffer ran out of room; the caller should retry
    /// with the next larger buffer size.
    BufferOverflow,
    /// The message did not fit even in the largest attempted buffer.
    MessageTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
            Error::BufferOverflow => write!(f, "buffer overflowed its fixed capacity"),
            Error::MessageTooLarge => write!(f, "message too large to encode"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A fixed-capacity buffer which can be written to, for serialisation
/// purposes, plus the domain-name-suffix-to-offset map used for
/// compression.
///
/// The capacity is fixed (rather than growing the `BytesMut`) so that
/// [`Message::to_octets`]'s buffer-size ladder can detect overflow and
/// retry at the next size, matching the reference resolver's
/// behaviour of attempting 512, then two progressively larger TCP
/// buffers, before giving up.
pub struct WritableBuffer {
    pub octets: BytesMut,
    capacity: usize,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self::with_capacity(512)
    }
}

impl WritableBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            octets: BytesMut::with_capacity(capacity),
            capacity,
            name_pointers: HashMap::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn memoise_name(&mut self, name: &DomainName) {
        // a pointer's offset field is 14 bits (0xC000 | offset), so an
        // offset at or beyond 0x4000 cannot be memoised - the high
        // bits would collide with the 0b11 pointer tag and decode to
        // the wrong target.
        if !name.is_root() && !self.name_pointers.contains_key(name) && self.index() <= 0x3FFF {
            if let Ok(index) = u16::try_from(self.index()) {
                let [hi, lo] = index.to_be_bytes();
                self.name_pointers
                    .insert(name.clone(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
            }
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) -> Result<(), Error> {
        self.write_octets(&[octet])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), Error> {
        self.write_octets(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.write_octets(&value.to_be_bytes())
    }

    pub fn write_octets(&mut self, octets: &[u8]) -> Result<(), Error> {
        if self.octets.len() + octets.len() > self.capacity {
            return Err(Error::BufferOverflow);
        }
        self.octets.put_slice(octets);
        Ok(())
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_in() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1).unwrap();
        buf.write_u8(2).unwrap();
        buf.write_u8(3).unwrap();
        buf.write_u8(4).unwrap();
        domain("www.example.com.").serialise(&mut buf, true).unwrap();
        domain("www.example.com.").serialise(&mut buf, true).unwrap();

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                0b1100_0000, 0b0000_0100 // pointer
            ],
            buf.octets,
        );
    }

    /// Scenario 2: encoding `["www.cnn.com.", "cnn.com."]` into an
    /// empty buffer must share the `cnn.com` suffix, not just whole
    /// identical names - the second name is two bytes, a pointer to
    /// where "cnn" starts in the first encoding.
    #[test]
    #[rustfmt::skip]
    fn test_name_compression_shares_suffix() {
        let mut buf = WritableBuffer::default();
        domain("www.cnn.com.").serialise(&mut buf, true).unwrap();
        domain("cnn.com.").serialise(&mut buf, true).unwrap();

        assert_eq!(
            vec![
                // domain 1: "www.cnn.com."
                3, 119, 119, 119, // "www"
                3, 99, 110, 110, // "cnn"
                3, 99, 111, 109, 0, // "com"
                // domain 2: "cnn.com." - a pointer to offset 4, where
                // "cnn" starts in the first encoding
                0b1100_0000, 0b0000_0100,
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1).unwrap();
        buf.write_u8(2).unwrap();
        buf.write_u8(3).unwrap();
        buf.write_u8(4).unwrap();
        domain("www.example.com.").serialise(&mut buf, true).unwrap();
        domain("www.example.com.").serialise(&mut buf, false).unwrap();

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_header_roundtrip_scenario() {
        // from the spec: id=0x029A, opcode=QUERY, RD=true, one question
        // "www.state.gov" A IN
        let message = Message::from_question(
            0x029A,
            Question {
                name: domain("www.state.gov."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );
        let mut message = message;
        message.header.recursion_desired = true;

        let octets = message.to_octets().unwrap();
        assert_eq!(
            &[0x02, 0x9A, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &octets[0..12]
        );
    }

    #[test]
    fn test_label_encoding_scenario() {
        let mut buf = WritableBuffer::default();
        domain("www.").serialise(&mut buf, false).unwrap();
        assert_eq!(vec![3, 119, 119, 119, 0], buf.octets);
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_records() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1).unwrap();
        buf.write_u8(2).unwrap();
        buf.write_u8(3).unwrap();
        buf.write_u8(4).unwrap();

        Question {
            name: domain("www.example.com."),
            qtype: QueryType::Wildcard,
            qclass: QueryClass::Wildcard,
        }.serialise(&mut buf).unwrap();

        ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }.serialise(&mut buf).unwrap();

        ResourceRecord {
            name: domain("mx.example.com."),
            rtype_with_data: RecordTypeWithData::CNAME {
                cname: domain("www.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }.serialise(&mut buf).unwrap();

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // QNAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // QTYPE
                0, 255,
                // QCLASS
                0, 255,
                // NAME
                0b1100_0000, 0b0000_0100, // pointer to "www.example.com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0010, // 18 octets
                // RDATA
                0, 32, // preference
                2, 109, 120, // "mx"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // NAME
                0b1100_0000, 0b0010_0111, // pointer to "mx.example.com"
                // TYPE
                0b0000_0000, 0b0000_0101, // CNAME
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0001, // 17 octets
                // RDATA
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_overflow_retries_at_next_size() {
        // a message with enough records that it cannot fit in 512
        // bytes must still serialise via `to_octets`'s ladder.
        let mut answers = Vec::new();
        for i in 0..100u8 {
            answers.push(ResourceRecord {
                name: domain(&format!("host-{i}.example.com.")),
                rtype_with_data: RecordTypeWithData::A {
                    address: std::net::Ipv4Addr::new(10, 0, 0, i),
                },
                rclass: RecordClass::IN,
                ttl: 300,
            });
        }
        let message = Message {
            header: Header::query(1, true),
            questions: vec![],
            answers,
            authority: vec![],
            additional: vec![],
        };

        let octets = message.to_octets().unwrap();
        assert!(octets.len() > 512);
    }
}
