#[no_mangle]
pub static BUILTIN_TABLE: [u32; 4] = [1, 2, 3, 4];

#[no_mangle]
pub static BUILTIN_TABLE_REF: &[u32; 4] = &BUILTIN_TABLE;

#[no_mangle]
pub extern "C" fn builtin_answer() -> u32 {
    42
}
