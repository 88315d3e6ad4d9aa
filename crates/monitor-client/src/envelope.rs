// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-item transport payloads.
//!
//! # Format
//!
//! ```text
//! {"event_id":"...","sent_at":"...","sdk":{...},"trace":{...}}\n
//! {"type":"event","length":41}\n
//! <41 payload bytes>\n
//! {"type":"session","length":120}\n
//! <120 payload bytes>\n
//! ```
//!
//! The header line is a single JSON object; each item is a JSON header line with the
//! exact payload length followed by the payload bytes and a newline.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::EnvelopeError;
use crate::outcomes::{ClientReport, DataCategory};
use crate::protocol::{ClientSdkInfo, Event, EventId};
use crate::sampling::DynamicSamplingContext;
use crate::session::{CheckIn, Session, SessionAggregates};

/// Value of the `type` field of an item header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Event,
    Transaction,
    Session,
    Sessions,
    CheckIn,
    ClientReport,
}

impl ItemType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Event => "event",
            ItemType::Transaction => "transaction",
            ItemType::Session => "session",
            ItemType::Sessions => "sessions",
            ItemType::CheckIn => "check_in",
            ItemType::ClientReport => "client_report",
        }
    }

    #[must_use]
    pub fn data_category(&self) -> DataCategory {
        match self {
            ItemType::Event => DataCategory::Error,
            ItemType::Transaction => DataCategory::Transaction,
            ItemType::Session | ItemType::Sessions => DataCategory::Session,
            ItemType::CheckIn => DataCategory::Monitor,
            ItemType::ClientReport => DataCategory::Internal,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finalized, typed item waiting to be serialized into an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Event(Box<Event>),
    Transaction(Box<Event>),
    Session(Session),
    SessionAggregates(SessionAggregates),
    CheckIn(CheckIn),
    ClientReport(ClientReport),
}

impl Item {
    #[must_use]
    pub fn item_type(&self) -> ItemType {
        match self {
            Item::Event(_) => ItemType::Event,
            Item::Transaction(_) => ItemType::Transaction,
            Item::Session(_) => ItemType::Session,
            Item::SessionAggregates(_) => ItemType::Sessions,
            Item::CheckIn(_) => ItemType::CheckIn,
            Item::ClientReport(_) => ItemType::ClientReport,
        }
    }

    #[must_use]
    pub fn event(&self) -> Option<&Event> {
        match self {
            Item::Event(event) | Item::Transaction(event) => Some(event),
            _ => None,
        }
    }

    fn to_payload(&self) -> Result<Bytes, EnvelopeError> {
        let payload = match self {
            Item::Event(event) | Item::Transaction(event) => serde_json::to_vec(event)?,
            Item::Session(session) => serde_json::to_vec(session)?,
            Item::SessionAggregates(aggregates) => serde_json::to_vec(aggregates)?,
            Item::CheckIn(check_in) => serde_json::to_vec(check_in)?,
            Item::ClientReport(report) => serde_json::to_vec(report)?,
        };
        Ok(Bytes::from(payload))
    }
}

/// First line of an envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub sent_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<ClientSdkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<DynamicSamplingContext>,
}

#[derive(Serialize, Deserialize)]
struct ItemHeader {
    #[serde(rename = "type")]
    ty: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<usize>,
}

/// One serialized item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeItem {
    item_type: ItemType,
    payload: Bytes,
}

impl EnvelopeItem {
    #[must_use]
    pub fn new(item_type: ItemType, payload: Bytes) -> Self {
        Self { item_type, payload }
    }

    #[must_use]
    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    #[must_use]
    pub fn data_category(&self) -> DataCategory {
        self.item_type.data_category()
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Serialized payload handed to the transport. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    header: EnvelopeHeader,
    items: Vec<EnvelopeItem>,
}

impl Envelope {
    #[must_use]
    pub fn from_parts(header: EnvelopeHeader, items: Vec<EnvelopeItem>) -> Self {
        Self { header, items }
    }

    #[must_use]
    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    #[must_use]
    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    #[must_use]
    pub fn event_id(&self) -> Option<EventId> {
        self.header.event_id
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// New envelope keeping only the items accepted by `keep`, `None` if none remain.
    #[must_use]
    pub fn filter<F>(&self, mut keep: F) -> Option<Envelope>
    where
        F: FnMut(&EnvelopeItem) -> bool,
    {
        let items: Vec<EnvelopeItem> = self
            .items
            .iter()
            .filter(|item| keep(item))
            .cloned()
            .collect();
        if items.is_empty() {
            return None;
        }
        let mut header = self.header.clone();
        let carries_event = items
            .iter()
            .any(|item| matches!(item.item_type, ItemType::Event | ItemType::Transaction));
        if !carries_event {
            header.event_id = None;
        }
        Some(Envelope { header, items })
    }

    pub fn to_bytes(&self) -> Result<Bytes, EnvelopeError> {
        let mut buf = BytesMut::new();
        {
            let mut writer = (&mut buf).writer();
            serde_json::to_writer(&mut writer, &self.header)?;
        }
        buf.put_u8(b'\n');
        for item in &self.items {
            let header = ItemHeader {
                ty: item.item_type,
                length: Some(item.payload.len()),
            };
            {
                let mut writer = (&mut buf).writer();
                serde_json::to_writer(&mut writer, &header)?;
            }
            buf.put_u8(b'\n');
            buf.put_slice(&item.payload);
            buf.put_u8(b'\n');
        }
        Ok(buf.freeze())
    }

    /// Parses the serialized form produced by [`Envelope::to_bytes`].
    ///
    /// Items without a `length` extend to the next newline.
    pub fn parse(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let (header_line, mut rest) = split_line(bytes);
        if header_line.iter().all(u8::is_ascii_whitespace) {
            return Err(EnvelopeError::MissingHeader);
        }
        let header: EnvelopeHeader = serde_json::from_slice(header_line)?;

        let mut items = Vec::new();
        while !rest.is_empty() {
            let (item_line, after_header) = split_line(rest);
            if item_line.is_empty() {
                rest = after_header;
                continue;
            }
            let item_header: ItemHeader = serde_json::from_slice(item_line)?;
            let (payload, after_payload) = match item_header.length {
                Some(length) => {
                    if after_header.len() < length {
                        return Err(EnvelopeError::UnexpectedEof {
                            expected: length,
                            available: after_header.len(),
                        });
                    }
                    let (payload, tail) = after_header.split_at(length);
                    let tail = match tail.first() {
                        None => tail,
                        Some(b'\n') => &tail[1..],
                        Some(_) => return Err(EnvelopeError::MissingTerminator),
                    };
                    (payload, tail)
                }
                None => split_line(after_header),
            };
            items.push(EnvelopeItem {
                item_type: item_header.ty,
                payload: Bytes::copy_from_slice(payload),
            });
            rest = after_payload;
        }
        Ok(Envelope { header, items })
    }
}

fn split_line(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|b| *b == b'\n') {
        Some(index) => (&bytes[..index], &bytes[index + 1..]),
        None => (bytes, &[]),
    }
}

/// Assembles envelopes with the client's SDK metadata and DSN.
#[derive(Clone, Debug, Default)]
pub struct EnvelopeBuilder {
    sdk: ClientSdkInfo,
    dsn: Option<String>,
}

impl EnvelopeBuilder {
    #[must_use]
    pub fn new(sdk: ClientSdkInfo, dsn: Option<String>) -> Self {
        Self { sdk, dsn }
    }

    /// Serializes `items` in order into a single envelope.
    ///
    /// The header carries the id of the first event or transaction and `trace` when a
    /// dynamic sampling context is given.
    pub fn build(
        &self,
        items: &[Item],
        trace: Option<&DynamicSamplingContext>,
    ) -> Result<Envelope, EnvelopeError> {
        let event_id = items.iter().find_map(|item| item.event().map(|event| event.event_id));
        let header = EnvelopeHeader {
            event_id,
            sent_at: Some(OffsetDateTime::now_utc()),
            sdk: Some(self.sdk.clone()),
            dsn: self.dsn.clone(),
            trace: trace.cloned(),
        };
        let items = items
            .iter()
            .map(|item| {
                Ok(EnvelopeItem {
                    item_type: item.item_type(),
                    payload: item.to_payload()?,
                })
            })
            .collect::<Result<Vec<_>, EnvelopeError>>()?;
        Ok(Envelope { header, items })
    }
}
