use proptest::prelude::*;

use crate::storage::{
    cell::local_payload_len,
    overflow::CellContent,
    page::MemPage,
    sqlite3_ondisk::PageType,
    testing::{table_leaf_cell, TestTree},
};

#[derive(Debug, Clone)]
enum Op {
    Insert { slot: usize, len: usize },
    Drop { slot: usize },
    Defragment,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<usize>(), 0usize..120).prop_map(|(slot, len)| Op::Insert { slot, len }),
        3 => any::<usize>().prop_map(|slot| Op::Drop { slot }),
        1 => Just(Op::Defragment),
    ]
}

fn decoded_state(page: &MemPage) -> (usize, usize, usize, bool, bool, bool) {
    (
        page.n_free(),
        page.cell_count(),
        page.header_size(),
        page.is_leaf(),
        page.int_key(),
        page.has_data(),
    )
}

fn check_page(page: &mut MemPage) -> Result<(), TestCaseError> {
    let usable = page.config().usable_size as usize;
    let cells: usize = (0..page.cell_count())
        .map(|i| page.cell_size(i).unwrap() + 2)
        .sum();
    prop_assert_eq!(page.n_free() + cells + page.header_size(), usable);

    let blocks = page.free_blocks().unwrap();
    for pair in blocks.windows(2) {
        let (a, a_size) = pair[0];
        let (b, _) = pair[1];
        prop_assert!(a + a_size + 3 < b, "free blocks {:?} not merged", pair);
    }
    for (offset, size) in &blocks {
        prop_assert!(*size >= 4);
        prop_assert!(offset + size <= usable);
    }

    let before = decoded_state(page);
    page.invalidate();
    page.init_page().unwrap();
    let first = decoded_state(page);
    page.invalidate();
    page.init_page().unwrap();
    prop_assert_eq!(before, first);
    prop_assert_eq!(first, decoded_state(page));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn page_accounting_survives_insert_drop_sequences(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::TableLeaf);
        let mut rowid = 0i64;
        for op in ops {
            match op {
                Op::Insert { slot, len } => {
                    let cell = table_leaf_cell(rowid, &vec![rowid as u8; len]);
                    rowid += 1;
                    if cell.len() + 2 > page.n_free() {
                        continue;
                    }
                    let i = slot % (page.cell_count() + 1);
                    page.insert_cell(&mut tree.bt, i, &cell, None).unwrap();
                    prop_assert!(page.overflow_cells().is_empty());
                    prop_assert_eq!(&page.find_cell(i).unwrap()[..cell.len()], cell.as_slice());
                }
                Op::Drop { slot } => {
                    if page.cell_count() == 0 {
                        continue;
                    }
                    let i = slot % page.cell_count();
                    let size = page.cell_size(i).unwrap();
                    page.drop_cell(i, size).unwrap();
                }
                Op::Defragment => {
                    let n_free = page.n_free();
                    page.defragment_page().unwrap();
                    prop_assert!(page.free_blocks().unwrap().is_empty());
                    prop_assert_eq!(page.n_free(), n_free);
                }
            }
            check_page(&mut page)?;
        }

        while page.cell_count() > 0 {
            let size = page.cell_size(0).unwrap();
            page.drop_cell(0, size).unwrap();
        }
        prop_assert_eq!(page.n_free(), 1016);
        tree.release(page);
    }

    #[test]
    fn table_cells_parse_back(rowid in any::<i64>(), len in 0usize..4000, n_zero in 0u32..600) {
        let mut tree = TestTree::new(1024);
        let page = tree.new_page(PageType::TableLeaf);
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut cell = Vec::new();
        let content = CellContent::Table { rowid, data: &data, n_zero };
        let size = page.fill_in_cell(&mut tree.bt, &mut cell, content).unwrap();

        let payload = (len as u32) + n_zero;
        let info = page.parse_cell_bytes(&cell).unwrap();
        let local = local_payload_len(payload, page.min_local(), page.max_local(), 1024);
        prop_assert_eq!(info.key, rowid);
        prop_assert_eq!(info.payload_len, payload);
        prop_assert_eq!(info.data_len, payload);
        prop_assert_eq!(info.local_len, local);
        prop_assert_eq!(info.size, size);
        prop_assert_eq!(cell.len(), size);
        prop_assert_eq!(info.has_overflow(), local < payload as usize);
        if info.has_overflow() {
            prop_assert_eq!(info.overflow_offset, info.header_len + local);
        }
        tree.release(page);
    }

    #[test]
    fn index_cells_parse_back(key in proptest::collection::vec(any::<u8>(), 0..3000)) {
        let mut tree = TestTree::new(1024);
        let page = tree.new_page(PageType::IndexLeaf);
        let mut cell = Vec::new();
        let size = page
            .fill_in_cell(&mut tree.bt, &mut cell, CellContent::Index { key: &key })
            .unwrap();
        let info = page.parse_cell_bytes(&cell).unwrap();
        prop_assert_eq!(info.key, key.len() as i64);
        prop_assert_eq!(info.payload_len as usize, key.len());
        prop_assert_eq!(info.data_len, 0);
        prop_assert_eq!(info.size, size);
        prop_assert_eq!(&cell[info.header_len..info.header_len + info.local_len], &key[..info.local_len]);

        page.clear_cell(&mut tree.bt, &cell).unwrap();
        let pages = (key.len() - info.local_len).div_ceil(1020) as u32;
        prop_assert_eq!(tree.bt.free_page_count().unwrap(), pages);
        tree.release(page);
        prop_assert_eq!(tree.pager().checked_out(), 1);
    }
}
