// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use shoal_model::{Offset, Term, Timestamp};

/// Kind of a record batch, as relevant to the archival core. The data-plane
/// batch types all fold into `RaftData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordBatchType {
    RaftData,
    RaftConfiguration,
    /// Single-record batches carrying a delete-records truncation point.
    PrefixTruncate,
    /// Batches produced by the archival metadata STM.
    ArchivalMetadata,
}

impl RecordBatchType {
    /// Control batches occupy model offsets but are invisible in kafka
    /// space.
    pub fn is_control(self) -> bool {
        !matches!(self, RecordBatchType::RaftData)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordBatchHeader {
    pub batch_type: RecordBatchType,
    /// Model offset of the first record; assigned at append time.
    pub base_offset: Offset,
    pub record_count: u32,
    pub term: Term,
    pub max_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    header: RecordBatchHeader,
    records: Vec<Record>,
}

impl RecordBatch {
    pub fn header(&self) -> &RecordBatchHeader {
        &self.header
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn base_offset(&self) -> Offset {
        self.header.base_offset
    }

    /// Model offset of the last record in the batch.
    pub fn last_offset(&self) -> Offset {
        Offset(self.header.base_offset.0 + i64::from(self.header.record_count) - 1)
    }

    /// Stamps the offsets and term a leader assigns at append time.
    pub fn assign(&mut self, base_offset: Offset, term: Term) {
        self.header.base_offset = base_offset;
        self.header.term = term;
    }
}

/// Builds a record batch one raw key/value at a time.
#[derive(Debug)]
pub struct RecordBatchBuilder {
    batch_type: RecordBatchType,
    base_offset: Offset,
    records: Vec<Record>,
}

impl RecordBatchBuilder {
    pub fn new(batch_type: RecordBatchType, base_offset: Offset) -> Self {
        RecordBatchBuilder {
            batch_type,
            base_offset,
            records: Vec::new(),
        }
    }

    pub fn add_raw_kv(&mut self, key: Bytes, value: Bytes) -> &mut Self {
        self.records.push(Record { key, value });
        self
    }

    pub fn build(self) -> RecordBatch {
        let record_count = u32::try_from(self.records.len()).expect("batch too large");
        RecordBatch {
            header: RecordBatchHeader {
                batch_type: self.batch_type,
                base_offset: self.base_offset,
                record_count,
                term: Term(0),
                max_timestamp: Timestamp::now(),
            },
            records: self.records,
        }
    }
}
