use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use coap_lite::{CoapOption, MessageType, ResponseType};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CoapConfig;
use crate::exchange::{BlockTransfer, Exchange, Origin};
use crate::message::{set_uint_option, uint_option, Request, Response};
use crate::stack::{Effects, Layer, Outcome};
use crate::EndpointError;

/// Decoded Block1/Block2 option value: `num`, the More bit and the size
/// exponent (block size = 2^(szx+4)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl BlockOption {
    pub(crate) fn new(num: u32, more: bool, szx: u8) -> Self {
        Self { num, more, szx }
    }

    pub(crate) fn size(&self) -> usize {
        16 << self.szx
    }

    fn from_value(value: u32) -> Self {
        Self {
            num: value >> 4,
            more: value & 0x8 != 0,
            szx: (value & 0x7) as u8,
        }
    }

    fn value(&self) -> u32 {
        (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx)
    }
}

pub(crate) fn block_of(packet: &coap_lite::Packet, option: CoapOption) -> Option<BlockOption> {
    uint_option(packet, option).map(BlockOption::from_value)
}

pub(crate) fn set_block(packet: &mut coap_lite::Packet, option: CoapOption, block: BlockOption) {
    set_uint_option(packet, option, block.value());
}

/// Size exponent for the largest RFC 7959 block size not above `size`.
fn szx_for(size: usize) -> u8 {
    let clamped = size.clamp(16, 1024);
    (clamped.ilog2() - 4) as u8
}

type TransferKey = (SocketAddr, String);

/// Reassembly buffer for a request body arriving in Block1 slices.
struct Assembly {
    buf: Vec<u8>,
    next_num: u32,
    token: Vec<u8>,
    created: Instant,
}

/// Cached body of a large response, served slice by slice to Block2
/// follow-up requests.
struct ServeCache {
    template: Response,
    body: Vec<u8>,
    szx: u8,
    created: Instant,
}

/// Middle layer: fragments large payloads into block sequences and
/// reassembles inbound blocks into one logical message before it travels
/// further up (RFC 7959).
pub(crate) struct BlockwiseLayer {
    max_message_size: usize,
    preferred_szx: u8,
    max_body_size: usize,
    transfer_lifetime: Duration,
    inbound_block1: DashMap<TransferKey, Assembly>,
    outbound_block2: DashMap<TransferKey, ServeCache>,
}

impl BlockwiseLayer {
    pub(crate) fn new(config: &CoapConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            preferred_szx: szx_for(config.preferred_block_size),
            max_body_size: config.max_resource_body_size,
            transfer_lifetime: config.exchange_lifetime,
            inbound_block1: DashMap::new(),
            outbound_block2: DashMap::new(),
        }
    }

    fn block_error(&self, request: &Request, status: ResponseType, block1: BlockOption) -> Response {
        let mut response = Response::for_request(request, status);
        set_block(response.packet_mut(), CoapOption::Block1, block1);
        response
    }
}

impl Layer for BlockwiseLayer {
    fn send_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Request,
        _effects: &mut Effects,
    ) -> Outcome {
        if request.payload().len() > self.max_message_size
            && block_of(request.packet(), CoapOption::Block1).is_none()
        {
            let szx = self.preferred_szx;
            let size = 16usize << szx;
            let body = request.payload().to_vec();
            let more = body.len() > size;
            let first = body[..size.min(body.len())].to_vec();
            trace!(body = body.len(), block = size, "fragmenting outbound request body");

            exchange.with_block1(|slot| {
                *slot = Some(BlockTransfer {
                    body,
                    next_num: 1,
                    szx,
                    token: request.token().to_vec(),
                })
            });
            set_block(
                request.packet_mut(),
                CoapOption::Block1,
                BlockOption::new(0, more, szx),
            );
            request.set_payload(first);
        }
        Outcome::Forward
    }

    fn send_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        _effects: &mut Effects,
    ) -> Outcome {
        if exchange.origin() == Origin::Remote
            && response.payload().len() > self.max_message_size
            && block_of(response.packet(), CoapOption::Block2).is_none()
        {
            // Honor the block size and number the peer asked for.
            let request = exchange.request();
            let requested = request
                .as_ref()
                .and_then(|r| block_of(r.packet(), CoapOption::Block2));
            let szx = requested
                .map(|b| b.szx.min(self.preferred_szx))
                .unwrap_or(self.preferred_szx);
            let size = 16usize << szx;

            let body = response.payload().to_vec();
            let mut template = response.clone();
            template.set_payload(Vec::new());
            template.reset_mid();

            let path = request.map(|r| r.path()).unwrap_or_default();
            self.outbound_block2.insert(
                (exchange.remote(), path),
                ServeCache {
                    template,
                    body: body.clone(),
                    szx,
                    created: Instant::now(),
                },
            );

            let num = requested
                .map(|b| b.num)
                .filter(|n| (*n as usize) * size < body.len())
                .unwrap_or(0);
            let offset = num as usize * size;
            let end = (offset + size).min(body.len());
            set_block(
                response.packet_mut(),
                CoapOption::Block2,
                BlockOption::new(num, end < body.len(), szx),
            );
            response.set_payload(body[offset..end].to_vec());
        }
        Outcome::Forward
    }

    fn receive_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Request,
        effects: &mut Effects,
    ) -> Outcome {
        let peer = match request.source() {
            Some(peer) => peer,
            None => return Outcome::Forward,
        };
        let path = request.path();

        // A follow-up asking for the next slice of a body we are serving.
        if let Some(block2) = block_of(request.packet(), CoapOption::Block2) {
            if block2.num > 0 {
                let key = (peer, path.clone());
                let slice = self.outbound_block2.get(&key).and_then(|cache| {
                    let size = 16usize << cache.szx;
                    let offset = block2.num as usize * size;
                    if offset >= cache.body.len() {
                        return None;
                    }
                    let end = (offset + size).min(cache.body.len());
                    let more = end < cache.body.len();
                    Some((cache.template.clone(), cache.body[offset..end].to_vec(), more, cache.szx))
                });

                if let Some((mut response, payload, more, szx)) = slice {
                    if !more {
                        self.outbound_block2.remove(&key);
                    }
                    response.set_token(request.token().to_vec());
                    response.set_destination(peer);
                    response.set_message_type(MessageType::NonConfirmable);
                    set_block(
                        response.packet_mut(),
                        CoapOption::Block2,
                        BlockOption::new(block2.num, more, szx),
                    );
                    response.set_payload(payload);
                    effects.responses.push((exchange.clone(), response));
                    return Outcome::Consumed;
                }
                // Unknown transfer: deliver upward so the resource can
                // regenerate the body.
            }
        }

        // A body arriving in Block1 slices.
        if let Some(block1) = block_of(request.packet(), CoapOption::Block1) {
            let key = (peer, path);
            let now = Instant::now();

            if block1.num == 0 {
                self.inbound_block1.insert(
                    key.clone(),
                    Assembly {
                        buf: Vec::new(),
                        next_num: 0,
                        token: request.token().to_vec(),
                        created: now,
                    },
                );
            }

            enum Step {
                Continue,
                Done(Vec<u8>),
                Incomplete,
                TooLarge,
            }

            let step = match self.inbound_block1.get_mut(&key) {
                None => Step::Incomplete,
                Some(mut assembly) => {
                    if block1.num != assembly.next_num || assembly.token != request.token() {
                        Step::Incomplete
                    } else {
                        assembly.buf.extend_from_slice(request.payload());
                        if assembly.buf.len() > self.max_body_size {
                            Step::TooLarge
                        } else {
                            assembly.next_num += 1;
                            if block1.more {
                                Step::Continue
                            } else {
                                Step::Done(std::mem::take(&mut assembly.buf))
                            }
                        }
                    }
                }
            };

            match step {
                Step::Continue => {
                    let mut response = self.block_error(
                        request,
                        ResponseType::Continue,
                        BlockOption::new(block1.num, true, block1.szx),
                    );
                    response.set_payload(Vec::new());
                    effects.responses.push((exchange.clone(), response));
                    Outcome::Consumed
                }
                Step::Done(body) => {
                    self.inbound_block1.remove(&key);
                    request.set_payload(body);
                    Outcome::Forward
                }
                Step::Incomplete => {
                    debug!(num = block1.num, "block sequence out of order");
                    self.inbound_block1.remove(&key);
                    let response = self.block_error(
                        request,
                        ResponseType::RequestEntityIncomplete,
                        block1,
                    );
                    effects.responses.push((exchange.clone(), response));
                    Outcome::Consumed
                }
                Step::TooLarge => {
                    self.inbound_block1.remove(&key);
                    let response = self.block_error(
                        request,
                        ResponseType::RequestEntityTooLarge,
                        block1,
                    );
                    effects.responses.push((exchange.clone(), response));
                    Outcome::Consumed
                }
            }
        } else {
            Outcome::Forward
        }
    }

    fn receive_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        effects: &mut Effects,
    ) -> Outcome {
        // Block1 handshake: the peer acknowledging slices of our upload.
        if block_of(response.packet(), CoapOption::Block1).is_some() {
            if response.status() == ResponseType::Continue {
                let follow = exchange.with_block1(|slot| {
                    let state = slot.as_mut()?;
                    let size = 16usize << state.szx;
                    let offset = state.next_num as usize * size;
                    if offset >= state.body.len() {
                        return None;
                    }
                    let end = (offset + size).min(state.body.len());
                    let chunk = state.body[offset..end].to_vec();
                    let step = (state.next_num, end < state.body.len(), chunk, state.szx);
                    state.next_num += 1;
                    Some(step)
                });
                if let Some((num, more, chunk, szx)) = follow {
                    if let Some(mut next) = exchange.request() {
                        next.reset_mid();
                        next.clear_observe();
                        set_block(
                            next.packet_mut(),
                            CoapOption::Block1,
                            BlockOption::new(num, more, szx),
                        );
                        next.set_payload(chunk);
                        effects.requests.push((exchange.clone(), next));
                    }
                }
                return Outcome::Consumed;
            }
            // Any other status ends the upload sequence.
            exchange.with_block1(|slot| *slot = None);
        }

        // Block2: the response body arriving in slices.
        if let Some(block2) = block_of(response.packet(), CoapOption::Block2) {
            if block2.num == 0 && !block2.more {
                return Outcome::Forward;
            }

            enum Step {
                Deliver(Vec<u8>),
                Continue(u32, u8),
                Drop,
                TooLarge,
            }

            let chunk = response.payload().to_vec();
            let max_body = self.max_body_size;
            let step = exchange.with_block2(|slot| {
                if block2.num == 0 {
                    *slot = Some(BlockTransfer {
                        body: Vec::new(),
                        next_num: 0,
                        szx: block2.szx,
                        token: response.token().to_vec(),
                    });
                }
                let state = match slot.as_mut() {
                    Some(state) => state,
                    None => return Step::Drop,
                };
                if block2.num != state.next_num {
                    return Step::Drop;
                }
                state.body.extend_from_slice(&chunk);
                if state.body.len() > max_body {
                    *slot = None;
                    return Step::TooLarge;
                }
                state.next_num += 1;
                if block2.more {
                    Step::Continue(state.next_num, state.szx)
                } else {
                    let body = std::mem::take(&mut state.body);
                    *slot = None;
                    Step::Deliver(body)
                }
            });

            match step {
                Step::Deliver(body) => {
                    response.set_payload(body);
                    Outcome::Forward
                }
                Step::Continue(num, szx) => {
                    if let Some(mut next) = exchange.request() {
                        next.reset_mid();
                        next.clear_observe();
                        next.set_payload(Vec::new());
                        next.packet_mut().clear_option(CoapOption::Block1);
                        set_block(
                            next.packet_mut(),
                            CoapOption::Block2,
                            BlockOption::new(num, false, szx),
                        );
                        effects.requests.push((exchange.clone(), next));
                    }
                    Outcome::Consumed
                }
                Step::Drop => {
                    debug!(num = block2.num, "unexpected block, dropping");
                    Outcome::Consumed
                }
                Step::TooLarge => {
                    exchange.fail(EndpointError::BodyTooLarge {
                        limit: self.max_body_size,
                    });
                    Outcome::Consumed
                }
            }
        } else {
            Outcome::Forward
        }
    }

    fn sweep(&self, now: Instant) {
        self.inbound_block1
            .retain(|_, a| now < a.created + self.transfer_lifetime);
        self.outbound_block2
            .retain(|_, c| now < c.created + self.transfer_lifetime);
    }
}
