//! Lazy row cursor over a range scan
//!
//! Rows are fetched one page at a time through `MeasurementStore::select_page`
//! and handed out in store order. The cursor is finite and can be rewound
//! with `restart`.

use super::{MeasurementStore, RangeQuery, StoreError, StoredRow};
use std::collections::VecDeque;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub struct Rows<'a> {
    store: &'a dyn MeasurementStore,
    query: RangeQuery,
    page_size: usize,
    buffer: VecDeque<StoredRow>,
    resume_after: Option<i64>,
    exhausted: bool,
    failed: bool,
}

impl<'a> Rows<'a> {
    pub fn new(store: &'a dyn MeasurementStore, query: RangeQuery) -> Self {
        Self::with_page_size(store, query, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(store: &'a dyn MeasurementStore, query: RangeQuery, page_size: usize) -> Self {
        Self {
            store,
            query,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            resume_after: None,
            exhausted: false,
            failed: false,
        }
    }

    pub fn query(&self) -> &RangeQuery {
        &self.query
    }

    /// Rewind to the first row of the range
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.resume_after = None;
        self.exhausted = false;
        self.failed = false;
    }

    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let page = self
            .store
            .select_page(&self.query, self.resume_after, self.page_size)?;

        log::trace!(
            "fetched page of {} rows for topic {} (resume after {:?})",
            page.rows.len(),
            self.query.topic_id,
            self.resume_after
        );

        self.buffer.extend(page.rows);
        match page.resume_key {
            Some(key) => self.resume_after = Some(key),
            None => self.exhausted = true,
        }
        Ok(())
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<StoredRow, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            // An error ends the iteration until restarted
            if self.exhausted || self.failed {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}
