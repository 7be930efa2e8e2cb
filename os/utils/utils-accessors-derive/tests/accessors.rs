use utils_accessors_derive::{Getters, Setters};

#[derive(Clone, Copy, Getters, Setters)]
struct Region {
    /// First byte of the region.
    start: u32,
    pages: u32,
    #[accessors(skip)]
    #[allow(dead_code)]
    tag: u8,
}

#[test]
fn setters_chain_and_getters_copy_out() {
    let mut region = Region { start: 0x1000, pages: 1, tag: 0 };
    region.set_start(0x2000).set_pages(4);
    assert_eq!(region.start(), 0x2000);
    assert_eq!(region.pages(), 4);

    let moved = region.with_start(0x0804_8000);
    assert_eq!(moved.start(), 0x0804_8000);
    assert_eq!(region.start(), 0x2000);
}

const fn pages_of(region: &Region) -> u32 {
    region.pages()
}

#[test]
fn getters_are_const() {
    const REGION: Region = Region { start: 0, pages: 7, tag: 1 };
    assert_eq!(pages_of(&REGION), 7);
}
