use crate::dns::types::{DnsClass, RecordType, ResponseCode};

/// Raw DNS packet codec - binary level parsing and encoding per RFC 1035.
/// No external DNS library used - everything is hand-parsed from &[u8].

#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,          // Query/Response flag
    pub opcode: u8,        // 4 bits
    pub aa: bool,          // Authoritative Answer
    pub tc: bool,          // Truncated
    pub rd: bool,          // Recursion Desired
    pub ra: bool,          // Recursion Available
    pub ad: bool,          // Authenticated Data
    pub rcode: ResponseCode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DnsClass,
}

/// One resource record. `rdata` is stored with any embedded names
/// decompressed, so the record can be re-encoded outside the packet it
/// was parsed from.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: DnsClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

/// Read one possibly-compressed name starting at `*offset`, leaving
/// `*offset` on the byte after the name as it appears in place
/// (RFC 1035 §4.1.4 pointer semantics).
pub fn parse_name(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let mut cur = Cursor::at(data, *offset);
    let mut name = String::new();
    let mut resume_at = None;
    let mut pointer_budget = POINTER_BUDGET;

    loop {
        let len = cur.u8()?;
        if len == 0 {
            break;
        }
        match len & 0xC0 {
            0xC0 => {
                let low = cur.u8()?;
                // The caller resumes right after the first pointer once
                // the jumped-to labels have been collected.
                resume_at.get_or_insert(cur.pos);
                if pointer_budget == 0 {
                    return Err(anyhow::anyhow!("compression pointer loop in name"));
                }
                pointer_budget -= 1;
                cur.pos = usize::from(u16::from_be_bytes([len & 0x3F, low]));
            }
            0x00 => {
                let label = cur.take(len as usize)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
            }
            reserved => {
                return Err(anyhow::anyhow!("reserved label type {:#04x} in name", reserved));
            }
        }
    }

    *offset = resume_at.unwrap_or(cur.pos);
    Ok(name)
}

/// How many compression pointers one name may chase. Real messages
/// chain one or two; anything deeper is a crafted loop.
const POINTER_BUDGET: usize = 16;

/// Bounds-checked reader over a raw message.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Cursor { data, pos }
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| anyhow::anyhow!("message ends early at byte {}", self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> anyhow::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> anyhow::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn flag(flags: u16, bit: u16) -> bool {
    flags >> bit & 1 == 1
}

/// Decode a whole message: header, questions, then the three record
/// sections in wire order.
pub fn parse_packet(data: &[u8]) -> anyhow::Result<DnsPacket> {
    let mut cur = Cursor::at(data, 0);
    let id = cur.u16()?;
    let flags = cur.u16()?;
    let qdcount = cur.u16()?;
    let ancount = cur.u16()?;
    let nscount = cur.u16()?;
    let arcount = cur.u16()?;

    let header = DnsHeader {
        id,
        qr: flag(flags, 15),
        opcode: (flags >> 11 & 0xF) as u8,
        aa: flag(flags, 10),
        tc: flag(flags, 9),
        rd: flag(flags, 8),
        ra: flag(flags, 7),
        ad: flag(flags, 5),
        rcode: ResponseCode::from((flags & 0xF) as u8),
        qdcount,
        ancount,
        nscount,
        arcount,
    };

    let mut pos = cur.pos;
    let questions = (0..qdcount)
        .map(|_| parse_question(data, &mut pos))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let answers = parse_section(data, &mut pos, ancount)?;
    let authorities = parse_section(data, &mut pos, nscount)?;
    let additionals = parse_section(data, &mut pos, arcount)?;

    Ok(DnsPacket {
        header,
        questions,
        answers,
        authorities,
        additionals,
    })
}

fn parse_question(data: &[u8], pos: &mut usize) -> anyhow::Result<DnsQuestion> {
    let name = parse_name(data, pos)?;
    let mut cur = Cursor::at(data, *pos);
    let qtype = RecordType::from(cur.u16()?);
    let qclass = DnsClass::from(cur.u16()?);
    *pos = cur.pos;
    Ok(DnsQuestion { name, qtype, qclass })
}

fn parse_section(data: &[u8], pos: &mut usize, count: u16) -> anyhow::Result<Vec<DnsRecord>> {
    (0..count).map(|_| parse_record(data, pos)).collect()
}

fn parse_record(data: &[u8], pos: &mut usize) -> anyhow::Result<DnsRecord> {
    let name = parse_name(data, pos)?;
    let mut cur = Cursor::at(data, *pos);
    let rtype = RecordType::from(cur.u16()?);
    let rclass = DnsClass::from(cur.u16()?);
    let ttl = cur.u32()?;
    let rdlength = cur.u16()? as usize;
    let rdata_start = cur.pos;
    cur.take(rdlength)?;
    *pos = cur.pos;

    let rdata = decompress_rdata(data, rdata_start, rdlength, rtype)?;
    Ok(DnsRecord {
        name,
        rtype,
        rclass,
        ttl,
        rdata,
    })
}

/// Rewrite rdata so that embedded names no longer contain compression
/// pointers into the enclosing packet. Records cached individually must
/// survive re-encoding into a different message.
fn decompress_rdata(
    data: &[u8],
    rdata_offset: usize,
    rdlength: usize,
    rtype: RecordType,
) -> anyhow::Result<Vec<u8>> {
    let raw = || data[rdata_offset..rdata_offset + rdlength].to_vec();

    match rtype {
        RecordType::CNAME | RecordType::NS | RecordType::PTR => {
            let mut off = rdata_offset;
            let name = parse_name(data, &mut off)?;
            Ok(encode_name(&name))
        }
        RecordType::MX => {
            if rdlength < 3 {
                return Err(anyhow::anyhow!("MX rdata too short: {} bytes", rdlength));
            }
            let mut out = data[rdata_offset..rdata_offset + 2].to_vec();
            let mut off = rdata_offset + 2;
            let name = parse_name(data, &mut off)?;
            out.extend_from_slice(&encode_name(&name));
            Ok(out)
        }
        RecordType::SRV => {
            if rdlength < 7 {
                return Err(anyhow::anyhow!("SRV rdata too short: {} bytes", rdlength));
            }
            let mut out = data[rdata_offset..rdata_offset + 6].to_vec();
            let mut off = rdata_offset + 6;
            let name = parse_name(data, &mut off)?;
            out.extend_from_slice(&encode_name(&name));
            Ok(out)
        }
        RecordType::SOA => {
            let mut off = rdata_offset;
            let mname = parse_name(data, &mut off)?;
            let rname = parse_name(data, &mut off)?;
            if off + 20 > data.len() {
                return Err(anyhow::anyhow!("SOA rdata truncated"));
            }
            let mut out = encode_name(&mname);
            out.extend_from_slice(&encode_name(&rname));
            out.extend_from_slice(&data[off..off + 20]);
            Ok(out)
        }
        _ => Ok(raw()),
    }
}

/// Encode a DNS name into wire format (no compression). Accepts names
/// with or without a trailing dot.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut result = Vec::new();
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        result.push(label.len() as u8);
        result.extend_from_slice(label.as_bytes());
    }
    result.push(0);
    result
}

fn encode_question(out: &mut Vec<u8>, question: &DnsQuestion) {
    out.extend_from_slice(&encode_name(&question.name));
    out.extend_from_slice(&question.qtype.to_u16().to_be_bytes());
    out.extend_from_slice(&question.qclass.to_u16().to_be_bytes());
}

fn encode_record(out: &mut Vec<u8>, record: &DnsRecord) {
    out.extend_from_slice(&encode_name(&record.name));
    out.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
    out.extend_from_slice(&record.rclass.to_u16().to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());
    out.extend_from_slice(&(record.rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&record.rdata);
}

/// Build a query packet for upstream forwarding. RD and AD are set, the
/// way our own outgoing questions always are.
pub fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    packet.extend_from_slice(&id.to_be_bytes());
    let flags: u16 = 0x0100 | 0x0020; // RD=1, AD=1
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    packet.extend_from_slice(&encode_name(name));
    packet.extend_from_slice(&qtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&DnsClass::IN.to_u16().to_be_bytes());

    packet
}

/// A reply to a client, encoded without name compression.
/// RecursionAvailable is always set on encoded replies.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u16,
    pub question: DnsQuestion,
    pub response: bool,
    pub recursion_desired: bool,
    pub authenticated: bool,
    pub rcode: ResponseCode,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl Reply {
    /// An answerless reply carrying only a status code.
    pub fn status(id: u16, question: DnsQuestion, response: bool, rcode: ResponseCode) -> Self {
        Reply {
            id,
            question,
            response,
            recursion_desired: true,
            authenticated: false,
            rcode,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(512);

        packet.extend_from_slice(&self.id.to_be_bytes());
        let mut flags: u16 = 0x0080; // RA=1
        if self.response {
            flags |= 0x8000;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.authenticated {
            flags |= 0x0020;
        }
        flags |= self.rcode.to_u8() as u16;
        packet.extend_from_slice(&flags.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        packet.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        packet.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        encode_question(&mut packet, &self.question);
        for record in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            encode_record(&mut packet, record);
        }

        packet
    }
}
