//! Fuzz target for on-disk page decoding.
//!
//! Reads arbitrary bytes as a meta page, leaf, branch, or overflow page.
//! Decoding may fail but must never panic. Overflow references found in a
//! leaf are followed through a small reader that serves the same bytes for
//! every page, so bogus lengths and page IDs reach `read_chain`.

#![no_main]

use libfuzzer_sys::fuzz_target;

use kvs_store::{
    Error, MetaRecord, Page, PageId, PageReader, Result,
    btree::{
        node::{BranchNodeRef, CellValue, LeafNodeRef},
        overflow,
    },
};

const PAGE_SIZE: usize = 512;

/// Pages in the simulated file.
const PAGE_COUNT: PageId = 64;

/// Serves one fuzzed page under every in-range page ID.
struct RepeatingReader<'a> {
    page: &'a Page,
}

impl PageReader for RepeatingReader<'_> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if page_id >= PAGE_COUNT {
            return Err(Error::PageNotFound { page_id });
        }
        Ok(Page::from_bytes(page_id, self.page.data.clone()))
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn page_count(&self) -> PageId {
        PAGE_COUNT
    }
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let selector = data[0] % 4;
    let mut bytes = data[1..].to_vec();
    bytes.resize(PAGE_SIZE, 0);
    let page = Page::from_bytes(7, bytes);

    match selector {
        0 => fuzz_meta(&page),
        1 => fuzz_leaf(&page),
        2 => fuzz_branch(&page),
        _ => {
            let _ = overflow::decode_page(&page);
        },
    }
});

fn fuzz_meta(page: &Page) {
    if let Ok(meta) = MetaRecord::from_page(&page.data) {
        let reencoded = meta.to_page(0);
        let decoded = MetaRecord::from_page(&reencoded.data).expect("re-encoded meta decodes");
        assert_eq!(decoded, meta, "meta record roundtrip mismatch");
    }
}

fn fuzz_leaf(page: &Page) {
    let Ok(leaf) = LeafNodeRef::from_page(page) else {
        return;
    };
    let reader = RepeatingReader { page };
    for i in 0..leaf.cell_count() {
        if let Ok((_, CellValue::Overflow { first_page, len })) = leaf.get(i) {
            let _ = overflow::read_chain(&reader, first_page, len);
        }
    }
    let _ = leaf.search(b"probe");
    let _ = leaf.used_space();
}

fn fuzz_branch(page: &Page) {
    let Ok(branch) = BranchNodeRef::from_page(page) else {
        return;
    };
    for i in 0..=branch.cell_count() {
        let _ = branch.child(i);
    }
    let _ = branch.child_index_for(b"probe");
    let _ = branch.used_space();
}
