//! Deserialisation of DNS messages from the wire format.  See the
//! `types` module for details of the format.
//!
//! Domain-name compression pointers are expanded eagerly: a pointer
//! must always point strictly before the position at which the name
//! being decoded started (RFC 1035 section 4.1.4), so recursing into
//! the pointed-to position is always progress towards offset zero and
//! cannot loop forever. That backwards-only rule is enforced in
//! [`DomainName::deserialise`] and is what makes `compression_loop`
//! detectable rather than merely "eventually runs out of input".

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

/// The header plus the four section counts, which only matter during
/// (de)serialisation - the counts can always be recovered from the
/// lengths of the `Message`'s vectors.
struct WireHeader {
    header: Header,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

impl WireHeader {
    fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        let flags1 = buffer.next_u8().ok_or(Error::DecodeShortBuffer)?;
        let flags2 = buffer.next_u8().ok_or(Error::DecodeShortBuffer)?;
        let qdcount = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        let ancount = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        let nscount = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        let arcount = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                z: flags2 & HEADER_MASK_Z != 0,
                authenticated_data: flags2 & HEADER_MASK_AD != 0,
                checking_disabled: flags2 & HEADER_MASK_CD != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let qtype = QueryType::deserialise(buffer)?;
        let qclass = QueryClass::deserialise(buffer)?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let rtype = RecordType::deserialise(buffer)?;
        let rclass = RecordClass::deserialise(buffer)?;
        let ttl = buffer.next_u32().ok_or(Error::DecodeShortBuffer)?;
        let rdlength = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;

        let rdata_start = buffer.position();

        let raw_rdata = |buffer: &mut ConsumableBuffer| -> Result<bytes::Bytes, Error> {
            buffer
                .take(rdlength as usize)
                .map(bytes::Bytes::copy_from_slice)
                .ok_or(Error::DecodeShortBuffer)
        };

        // for records which embed domain names, deserialise them
        // through the shared buffer so compression pointers resolve.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(buffer.next_u32().ok_or(Error::DecodeShortBuffer)?),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(buffer)?,
                rname: DomainName::deserialise(buffer)?,
                serial: buffer.next_u32().ok_or(Error::DecodeShortBuffer)?,
                refresh: buffer.next_u32().ok_or(Error::DecodeShortBuffer)?,
                retry: buffer.next_u32().ok_or(Error::DecodeShortBuffer)?,
                expire: buffer.next_u32().ok_or(Error::DecodeShortBuffer)?,
                minimum: buffer.next_u32().ok_or(Error::DecodeShortBuffer)?,
            },
            RecordType::WKS => {
                if rdlength < 5 {
                    return Err(Error::RdlengthMismatch);
                }
                let address = Ipv4Addr::from(buffer.next_u32().ok_or(Error::DecodeShortBuffer)?);
                let protocol = buffer.next_u8().ok_or(Error::DecodeShortBuffer)?;
                let ports = buffer
                    .take((rdlength - 5) as usize)
                    .map(bytes::Bytes::copy_from_slice)
                    .ok_or(Error::DecodeShortBuffer)?;
                RecordTypeWithData::WKS {
                    address,
                    protocol,
                    ports,
                }
            }
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(buffer)?,
            },
            RecordType::HINFO => {
                let cpu = CharacterString::deserialise(buffer)?;
                let os = CharacterString::deserialise(buffer)?;
                RecordTypeWithData::HINFO { cpu, os }
            }
            RecordType::MINFO => RecordTypeWithData::MINFO {
                rmailbx: DomainName::deserialise(buffer)?,
                emailbx: DomainName::deserialise(buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                exchange: DomainName::deserialise(buffer)?,
            },
            RecordType::TXT => {
                let mut strings = Vec::new();
                while buffer.position() < rdata_start + (rdlength as usize) {
                    strings.push(CharacterString::deserialise(buffer)?);
                }
                RecordTypeWithData::TXT { strings }
            }
            RecordType::AAAA => RecordTypeWithData::AAAA {
                address: Ipv6Addr::new(
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                    buffer.next_u16().ok_or(Error::DecodeShortBuffer)?,
                ),
            },
            RecordType::Unimplemented(rtype) => RecordTypeWithData::Unimplemented {
                rtype,
                octets: raw_rdata(buffer)?,
            },
        };

        let rdata_stop = buffer.position();

        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::RdlengthMismatch)
        }
    }
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut len = 0usize;
        let start = buffer.position();

        loop {
            let size = buffer.next_u8().ok_or(Error::DecodeShortBuffer)?;

            if usize::from(size) <= LABEL_MAX_LEN {
                if size == 0 {
                    labels.push(Label::new());
                    len += 1;
                    break;
                }

                let octets = buffer.take(size as usize).ok_or(Error::DecodeShortBuffer)?;
                let label = Label::try_from(octets).map_err(|_| Error::BadLabel)?;
                len += 1 + usize::from(label.len());
                labels.push(label);

                if len > DOMAINNAME_MAX_LEN {
                    return Err(Error::NameTooLong);
                }
            } else if size >= 0b1100_0000 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DecodeShortBuffer)?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                // a pointer must point strictly before where this name
                // started, or it could cycle back on itself.
                if ptr >= start {
                    return Err(Error::CompressionLoop);
                }

                let mut suffix = DomainName::deserialise(&mut buffer.at_offset(ptr))?;
                len += suffix.len - 1; // the suffix's own root label is already counted once
                labels.append(&mut suffix.labels);
                break;
            } else {
                return Err(Error::BadLabel);
            }
        }

        if len > DOMAINNAME_MAX_LEN {
            Err(Error::NameTooLong)
        } else {
            Ok(DomainName { labels, len })
        }
    }
}

impl CharacterString {
    /// # Errors
    ///
    /// If the character-string cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let size = buffer.next_u8().ok_or(Error::DecodeShortBuffer)?;
        let octets = buffer.take(size as usize).ok_or(Error::DecodeShortBuffer)?;
        CharacterString::try_from(octets).map_err(|_| Error::BadLabel)
    }
}

impl QueryType {
    /// # Errors
    ///
    /// If the query type is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        Ok(Self::from(value))
    }
}

impl QueryClass {
    /// # Errors
    ///
    /// If the query class is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        Ok(Self::from(value))
    }
}

impl RecordType {
    /// # Errors
    ///
    /// If the record type is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        Ok(Self::from(value))
    }
}

impl RecordClass {
    /// # Errors
    ///
    /// If the record class is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::DecodeShortBuffer)?;
        Ok(Self::from(value))
    }
}

/// Errors encountered when parsing a datagram, named after the
/// conditions they signal rather than the section being parsed:
/// `unknown_code` is deliberately absent because an unrecognised
/// class or type code is not an error - it decodes to `Unimplemented`
/// and `RecordClass::Unknown` respectively.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// Ran out of bytes before a fixed-size field was fully read.
    DecodeShortBuffer,
    /// A label failed the ASCII/length/hyphen-placement rules.
    BadLabel,
    /// A label exceeded 63 bytes without being a compression pointer.
    LabelTooLong,
    /// A domain name's total encoded length exceeds 255 bytes.
    NameTooLong,
    /// A compression pointer did not point strictly backwards.
    CompressionLoop,
    /// The decoded RDATA did not consume exactly `rdlength` bytes.
    RdlengthMismatch,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::DecodeShortBuffer => write!(f, "buffer too short"),
            Error::BadLabel => write!(f, "invalid label"),
            Error::LabelTooLong => write!(f, "label too long"),
            Error::NameTooLong => write!(f, "domain name too long"),
            Error::CompressionLoop => write!(f, "compression pointer loop"),
            Error::RdlengthMismatch => write!(f, "rdlength did not match decoded rdata"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which is consumed as messages and their fields are
/// parsed. `at_offset` lets a compression pointer re-enter the same
/// underlying bytes at an earlier position without copying.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        let v = *self.octets.get(self.position)?;
        self.position += 1;
        Some(v)
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn test_label_decoding_scenario() {
        let mut buf = ConsumableBuffer::new(&[3, 119, 119, 119, 0]);
        let name = DomainName::deserialise(&mut buf).unwrap();
        assert_eq!("www.", name.to_dotted_string());
    }

    #[test]
    fn test_header_roundtrip_scenario() {
        let octets = [0x02, 0x9A, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut buf = ConsumableBuffer::new(&octets);
        let wire_header = WireHeader::deserialise(&mut buf).unwrap();
        assert_eq!(0x029A, wire_header.header.id);
        assert!(wire_header.header.recursion_desired);
        assert_eq!(Opcode::Standard, wire_header.header.opcode);
        assert_eq!(1, wire_header.qdcount);
    }

    #[test]
    fn test_compression_pointer_must_point_backwards() {
        // a name at offset 0 whose pointer targets offset 0 (itself)
        let octets = [0b1100_0000, 0b0000_0000];
        let mut buf = ConsumableBuffer::new(&octets);
        assert_eq!(Err(Error::CompressionLoop), DomainName::deserialise(&mut buf));
    }

    #[test]
    fn test_decode_encode_roundtrip() {
        let message = Message {
            header: Header::query(42, true),
            questions: vec![Question {
                name: domain("www.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: vec![a_record("www.example.com.", std::net::Ipv4Addr::new(1, 2, 3, 4))],
            authority: vec![ns_record("example.com.", "ns1.example.com.")],
            additional: vec![],
        };

        let octets = message.to_octets().unwrap();
        let decoded = Message::from_octets(&octets).unwrap();

        assert_eq!(message.header.id, decoded.header.id);
        assert_eq!(message.questions, decoded.questions);
        assert_eq!(message.answers, decoded.answers);
        assert_eq!(message.authority, decoded.authority);
    }

    #[test]
    fn test_txt_multi_string_roundtrip() {
        let rr = ResourceRecord {
            name: domain("txt.example.com."),
            rtype_with_data: RecordTypeWithData::TXT {
                strings: vec![
                    CharacterString::try_from(&b"hello"[..]).unwrap(),
                    CharacterString::try_from(&b"world"[..]).unwrap(),
                ],
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let message = Message {
            header: Header::query(1, false),
            questions: vec![],
            answers: vec![rr.clone()],
            authority: vec![],
            additional: vec![],
        };

        let octets = message.to_octets().unwrap();
        let decoded = Message::from_octets(&octets).unwrap();
        assert_eq!(vec![rr], decoded.answers);
    }

    #[test]
    fn test_unimplemented_type_roundtrip() {
        let rr = unimplemented_record("weird.example.com.", &[1, 2, 3, 4]);
        let message = Message {
            header: Header::query(1, false),
            questions: vec![],
            answers: vec![rr.clone()],
            authority: vec![],
            additional: vec![],
        };

        let octets = message.to_octets().unwrap();
        let decoded = Message::from_octets(&octets).unwrap();
        assert_eq!(1, decoded.answers.len());
        assert!(decoded.answers[0].is_unknown());
    }
}
