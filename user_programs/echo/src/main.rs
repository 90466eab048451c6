//! `echo`: prints its arguments (skipping `argv[0]`) separated by
//! spaces. Mostly a test of the argv block the kernel builds on the
//! user stack.

#![no_std]
#![no_main]

usys::entry!(main);

extern "C" fn main(argc: u32, argv: *const *const u8) -> i32 {
    for index in 1..argc {
        let Some(word) = usys::arg(argc, argv, index) else {
            break;
        };
        if index > 1 {
            usys::write(" ");
        }
        usys::write(word);
    }
    usys::write("\n");
    0
}
