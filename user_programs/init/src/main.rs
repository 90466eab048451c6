//! First user program: exercises the console and file syscalls, then
//! hands control back to the kernel shell.

#![no_std]
#![no_main]

usys::entry!(main);

const DEMO_PATH: &str = "/HELLO.TXT";

extern "C" fn main(_argc: u32, _argv: *const *const u8) -> i32 {
    usys::clear();
    usys::write("Hello from USER MODE!\n");

    let mut cwd = [0_u8; 128];
    if usys::getcwd(&mut cwd) == 0 {
        usys::write("cwd: ");
        write_bytes(&cwd);
        usys::write("\n");
    }

    // Demo: create/write/read a file via FD syscalls.
    let fd = usys::open(DEMO_PATH, usys::O_WRONLY | usys::O_CREAT | usys::O_TRUNC);
    if fd < 0 {
        usys::write("open(w) failed\n");
        return 1;
    }
    let message = b"Opal OS usermode write works.\n";
    if usys::writefd(fd, message) < 0 {
        usys::write("writefd failed\n");
        usys::close(fd);
        return 1;
    }
    usys::close(fd);

    let fd = usys::open(DEMO_PATH, usys::O_RDONLY);
    if fd < 0 {
        usys::write("open(r) failed\n");
        return 1;
    }
    let mut buf = [0_u8; 64];
    let got = usys::read(fd, &mut buf);
    usys::close(fd);

    if got > 0 {
        usys::write("read back: ");
        write_bytes(&buf[..got as usize]);
    } else {
        usys::write("read failed\n");
        return 1;
    }

    let mut listing = [0_u8; 256];
    if usys::listdir("/", &mut listing) >= 0 {
        usys::write("root directory:\n");
        write_bytes(&listing);
    }

    usys::write("init done.\n");
    0
}

/// Print a byte buffer up to its first NUL (or its end).
fn write_bytes(bytes: &[u8]) {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if let Ok(text) = core::str::from_utf8(&bytes[..len]) {
        usys::write(text);
    }
}
