//! User stack argument marshaling: given `argv`, build the initial stack
//! image a freshly-exec'd process expects, and report where `rdi`/`rsi`
//! should point.
//!
//! Layout from `stack_top` downward: each string (NUL-terminated, last
//! argument pushed first so they end up in order from low to high
//! addresses), padding down to an 8-byte boundary, a null word sentinel,
//! then each string's address (last to first), then a fake return address
//! of 0.

use alloc::vec::Vec;

pub struct StackImage {
    /// Bytes to write starting at `write_base` (lowest address used).
    pub bytes: Vec<u8>,
    pub write_base: u64,
    pub final_rsp: u64,
    pub argv_addr: u64,
    pub argc: u64,
}

/// Compute the stack image for `argv` with the stack starting at
/// `stack_top` (exclusive — the first byte written is at `stack_top - 1`).
pub fn build_stack_image(argv: &[&str], stack_top: u64) -> StackImage {
    let mut cursor = stack_top;
    let mut arg_addrs = Vec::with_capacity(argv.len());

    // Strings, last to first, each NUL-terminated.
    let mut string_bytes: Vec<u8> = Vec::new();
    for arg in argv.iter().rev() {
        let len = arg.len() + 1;
        cursor -= len as u64;
        arg_addrs.push(cursor);
        string_bytes.splice(0..0, arg.as_bytes().iter().copied().chain(core::iter::once(0u8)));
    }
    arg_addrs.reverse();

    // Align down to 8 bytes.
    let aligned = cursor & !0x7;
    let padding = (cursor - aligned) as usize;
    cursor = aligned;

    // Null sentinel word, then argv pointers, last to first.
    cursor -= 8;
    let null_word_addr = cursor;

    for _ in 0..argv.len() {
        cursor -= 8;
    }
    let argv_addr = cursor;

    // Fake return address.
    cursor -= 8;

    let total_len = (stack_top - cursor) as usize;
    let mut bytes = alloc::vec![0u8; total_len];
    let _ = padding;

    // Strings sit immediately below stack_top, written verbatim in the
    // order they were concatenated (last arg first, so low-to-high
    // addresses match push order).
    let strings_start = total_len - string_bytes.len();
    bytes[strings_start..strings_start + string_bytes.len()].copy_from_slice(&string_bytes);

    let null_word_idx = (null_word_addr - cursor) as usize;
    bytes[null_word_idx..null_word_idx + 8].copy_from_slice(&0u64.to_le_bytes());

    for (i, &addr) in arg_addrs.iter().enumerate() {
        let idx = (argv_addr - cursor) as usize + i * 8;
        bytes[idx..idx + 8].copy_from_slice(&addr.to_le_bytes());
    }

    let fake_ret_idx = (cursor - cursor) as usize;
    bytes[fake_ret_idx..fake_ret_idx + 8].copy_from_slice(&0u64.to_le_bytes());

    StackImage {
        bytes,
        write_base: cursor,
        final_rsp: cursor,
        argv_addr,
        argc: argv.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_rsp_is_eight_byte_aligned() {
        let img = build_stack_image(&["echo", "x", "y", "z"], 0x4747_8000);
        assert_eq!(img.final_rsp % 8, 0);
    }

    #[test]
    fn argc_matches_argv_len() {
        let img = build_stack_image(&["prog", "a", "b"], 0x4747_8000);
        assert_eq!(img.argc, 3);
    }

    #[test]
    fn argv_pointers_point_at_null_terminated_strings_in_order() {
        let img = build_stack_image(&["prog", "hello"], 0x4747_8000);
        let argv0_ptr_idx = (img.argv_addr - img.write_base) as usize;
        let argv0_addr = u64::from_le_bytes(img.bytes[argv0_ptr_idx..argv0_ptr_idx + 8].try_into().unwrap());
        let str_idx = (argv0_addr - img.write_base) as usize;
        let end = img.bytes[str_idx..].iter().position(|&b| b == 0).unwrap();
        assert_eq!(&img.bytes[str_idx..str_idx + end], b"prog");
    }

    #[test]
    fn null_sentinel_follows_last_argv_pointer() {
        let img = build_stack_image(&["a", "b"], 0x4747_8000);
        // The null word sits directly below the last (highest-address)
        // argv pointer slot.
        let last_ptr_idx = (img.argv_addr - img.write_base) as usize + 8 * 2;
        let null_word = u64::from_le_bytes(img.bytes[last_ptr_idx..last_ptr_idx + 8].try_into().unwrap());
        assert_eq!(null_word, 0);
    }

    #[test]
    fn fake_return_address_is_zero_at_the_very_bottom() {
        let img = build_stack_image(&["x"], 0x4747_8000);
        assert_eq!(u64::from_le_bytes(img.bytes[0..8].try_into().unwrap()), 0);
    }
}
