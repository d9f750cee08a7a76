//! Socket-free test double for the exchange capability.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dns::packet::{self, DnsRecord, Reply};
use crate::dns::types::{DnsClass, RecordType, ResponseCode};
use crate::upstream::exchange::Exchange;
use crate::upstream::server::{Server, PROBE_NAME};

/// How a mock server reacts to a query.
#[derive(Clone)]
pub enum Behavior {
    /// Answer the question after `delay` with one record of the
    /// requested type.
    Respond { delay: Duration },
    /// Answer with NXDOMAIN.
    NxDomain,
    /// Answer NoError with an empty answer section.
    Empty,
    /// Consume the whole client timeout, then fail.
    Timeout,
    /// Fail immediately.
    Refuse,
}

/// Exchange double with per-server behaviors and a query log. Startup
/// probes succeed by default so pools can be built around servers that
/// are meant to fail real queries.
pub struct MockExchange {
    behaviors: HashMap<String, Behavior>,
    default: Behavior,
    probes_succeed: bool,
    log: Mutex<Vec<(String, String, u16)>>,
}

impl MockExchange {
    pub fn new() -> Self {
        MockExchange {
            behaviors: HashMap::new(),
            default: Behavior::Respond {
                delay: Duration::from_millis(5),
            },
            probes_succeed: true,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_server(mut self, name: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn with_failing_probes(mut self) -> Self {
        self.probes_succeed = false;
        self.default = Behavior::Refuse;
        self
    }

    /// Number of exchanges recorded for one question.
    pub fn count_for(&self, qname: &str, qtype: RecordType) -> usize {
        let qtype = qtype.to_u16();
        self.log
            .lock()
            .iter()
            .filter(|(_, name, t)| name == qname && *t == qtype)
            .count()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn exchange(
        &self,
        query: &[u8],
        server: &Server,
        timeout: Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let request = packet::parse_packet(query)?;
        let question = request
            .questions
            .first()
            .ok_or_else(|| anyhow::anyhow!("query without question"))?
            .clone();

        let probe = question.name == PROBE_NAME.trim_end_matches('.');
        if !probe {
            self.log.lock().push((
                server.name.clone(),
                question.name.clone(),
                question.qtype.to_u16(),
            ));
        } else if self.probes_succeed {
            return Ok(answer(request.header.id, &question, false));
        }

        let behavior = self
            .behaviors
            .get(&server.name)
            .unwrap_or(&self.default)
            .clone();

        match behavior {
            Behavior::Respond { delay } => {
                tokio::time::sleep(delay).await;
                Ok(answer(request.header.id, &question, false))
            }
            Behavior::NxDomain => {
                let mut reply = Reply::status(
                    request.header.id,
                    question,
                    true,
                    ResponseCode::NxDomain,
                );
                reply.recursion_desired = request.header.rd;
                Ok(reply.encode())
            }
            Behavior::Empty => {
                Ok(Reply::status(request.header.id, question, true, ResponseCode::NoError).encode())
            }
            Behavior::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(anyhow::anyhow!("timeout waiting for {}", server.name))
            }
            Behavior::Refuse => Err(anyhow::anyhow!("connection refused by {}", server.name)),
        }
    }
}

/// One canned answer of the requested type. CNAME questions get an
/// empty NoError answer, the way most names resolve in practice; the
/// cache's CNAME behavior is exercised directly in its own tests.
pub fn answer(id: u16, question: &packet::DnsQuestion, authenticated: bool) -> Vec<u8> {
    let rdata = match question.qtype {
        RecordType::A => Some(vec![93, 184, 216, 34]),
        RecordType::AAAA => {
            let mut v6 = vec![0x20, 0x01, 0x0d, 0xb8];
            v6.extend_from_slice(&[0; 11]);
            v6.push(1);
            Some(v6)
        }
        RecordType::CNAME => None,
        RecordType::NS => Some(packet::encode_name("target.example")),
        RecordType::MX => {
            let mut rdata = vec![0, 10];
            rdata.extend_from_slice(&packet::encode_name("mail.example"));
            Some(rdata)
        }
        RecordType::TXT => Some(vec![4, b't', b'e', b's', b't']),
        _ => Some(vec![1, 2, 3, 4]),
    };

    let answers = rdata
        .map(|rdata| {
            vec![DnsRecord {
                name: question.name.clone(),
                rtype: question.qtype,
                rclass: DnsClass::IN,
                ttl: 60,
                rdata,
            }]
        })
        .unwrap_or_default();

    Reply {
        id,
        question: question.clone(),
        response: true,
        recursion_desired: true,
        authenticated,
        rcode: ResponseCode::NoError,
        answers,
        authorities: Vec::new(),
        additionals: Vec::new(),
    }
    .encode()
}
