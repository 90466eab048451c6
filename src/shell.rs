//! Interactive kernel shell.
//!
//! A line editor over the keyboard queue (cursor movement, in-line
//! insert/delete, 10-deep history) in front of the filesystem engine, the
//! exec layer and a handful of system commands. The shell runs in Ring 0
//! and doubles as the boot idle loop once `init` has exited.

use alloc::string::String;
use alloc::vec::Vec;

use crate::ata::AtaDisk;
use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::fat16::{self, Fat16Error};
use crate::keyboard::{self, KeyDecoder, KeyEvent};
use crate::vga_buffer::{self, clear_screen, BUFFER_HEIGHT, BUFFER_WIDTH};
use crate::{power, print, println, timer, userspace};

const HISTORY_SIZE: usize = 10;
const MAX_ARGS: usize = 16;

/// Run the shell forever.
pub fn run() -> ! {
    let mut shell = Shell::new();
    println!("\nType 'help' for the command list.");

    loop {
        let line = shell.read_line();
        shell.execute(&line);
    }
}

struct Shell {
    decoder: KeyDecoder,
    history: Vec<String>,
    history_index: usize,
    buffer: String,
    cursor: usize,
    prompt_col: usize,
}

impl Shell {
    fn new() -> Self {
        Self {
            decoder: KeyDecoder::new(),
            history: Vec::new(),
            history_index: 0,
            buffer: String::new(),
            cursor: 0,
            prompt_col: 0,
        }
    }

    fn prompt(&mut self) {
        let cwd = fat16::with_fs(|fs| Ok(String::from(fs.current_path())))
            .unwrap_or_else(|_| String::from("?"));
        print!("\nOpalOS@{cwd}$ ");

        self.prompt_col = vga_buffer::cursor_column();
        self.buffer.clear();
        self.cursor = 0;
        self.history_index = self.history.len();
    }

    /// Block until a full line is entered; echoes and edits as it goes.
    fn read_line(&mut self) -> String {
        self.prompt();

        loop {
            let Some(scancode) = keyboard::pop_scancode() else {
                // Nothing buffered: idle until the next interrupt.
                // SAFETY:
                // `sti; hlt` wakes on the next timer or keyboard interrupt.
                unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
                continue;
            };

            let Some(event) = self.decoder.decode(scancode) else {
                continue;
            };

            match event {
                KeyEvent::Char('\n') => {
                    print!("\n");
                    let line = self.buffer.clone();
                    self.remember(&line);
                    return line;
                }
                KeyEvent::Char('\x08') => {
                    if self.cursor > 0 {
                        self.cursor -= 1;
                        self.buffer.remove(self.cursor);
                        self.redraw();
                    }
                }
                KeyEvent::Char(character) => {
                    if character.is_ascii() && !character.is_control() {
                        let fits = self.prompt_col + self.buffer.len() < BUFFER_WIDTH - 1;
                        if fits {
                            self.buffer.insert(self.cursor, character);
                            self.cursor += 1;
                            self.redraw();
                        }
                    }
                }
                KeyEvent::ArrowLeft => {
                    if self.cursor > 0 {
                        self.cursor -= 1;
                        self.redraw();
                    }
                }
                KeyEvent::ArrowRight => {
                    if self.cursor < self.buffer.len() {
                        self.cursor += 1;
                        self.redraw();
                    }
                }
                KeyEvent::ArrowUp => {
                    if self.history_index > 0 {
                        self.history_index -= 1;
                        self.load_history_entry();
                    }
                }
                KeyEvent::ArrowDown => {
                    if self.history_index < self.history.len() {
                        self.history_index += 1;
                        self.load_history_entry();
                    }
                }
            }
        }
    }

    fn remember(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if self.history.len() == HISTORY_SIZE {
            self.history.remove(0);
        }
        self.history.push(String::from(line));
    }

    fn load_history_entry(&mut self) {
        self.buffer = self
            .history
            .get(self.history_index)
            .cloned()
            .unwrap_or_default();
        self.cursor = self.buffer.len();
        self.redraw();
    }

    /// Repaint the edited line in place and park the cursor.
    fn redraw(&mut self) {
        let row = BUFFER_HEIGHT - 1;

        for col in self.prompt_col..BUFFER_WIDTH {
            vga_buffer::put_char_at(b' ', col, row);
        }
        for (index, byte) in self.buffer.bytes().enumerate() {
            vga_buffer::put_char_at(byte, self.prompt_col + index, row);
        }
        vga_buffer::set_cursor_position(self.prompt_col + self.cursor, row);
    }

    fn execute(&mut self, line: &str) {
        let mut args: [&str; MAX_ARGS] = [""; MAX_ARGS];
        let mut argc = 0;
        for token in line.split_whitespace() {
            if argc == MAX_ARGS {
                break;
            }
            args[argc] = token;
            argc += 1;
        }
        if argc == 0 {
            return;
        }
        let args = &args[..argc];

        match args[0] {
            "help" => print_help(),
            "clear" => clear_screen(),
            "about" => println!("Opal OS: a small learning OS written in Rust."),
            "version" => println!("opal_os {}", env!("CARGO_PKG_VERSION")),
            "uname" => println!("OpalOS i386 {}", env!("CARGO_PKG_VERSION")),
            "uptime" => println!("up {} seconds ({} ticks)", timer::uptime_seconds(), timer::ticks()),
            "sleep" => cmd_sleep(args),
            "halt" => {
                println!("Halting.");
                power::halt();
            }
            "reboot" => power::reboot(),
            "history" => {
                for (index, entry) in self.history.iter().enumerate() {
                    println!("{index:3}  {entry}");
                }
            }
            "echo" => {
                for (index, word) in args[1..].iter().enumerate() {
                    if index > 0 {
                        print!(" ");
                    }
                    print!("{word}");
                }
                println!();
            }
            "diskread" => cmd_diskread(),
            "disktest" => cmd_disktest(),
            "fatinfo" => cmd_fatinfo(),
            "ls" => cmd_ls(args),
            "pwd" => match fat16::with_fs(|fs| Ok(String::from(fs.current_path()))) {
                Ok(cwd) => println!("{cwd}"),
                Err(err) => println!("pwd: {err}"),
            },
            "cd" => cmd_fs_one(args, "cd", |fs, path| fs.change_dir(path)),
            "touch" => cmd_fs_one(args, "touch", fat16::Fat16::touch),
            "mkdir" => cmd_mkdir(args),
            "cat" => cmd_cat(args),
            "write" => cmd_write(args, false),
            "append" => cmd_write(args, true),
            "rm" => cmd_rm(args),
            "rmdir" => cmd_fs_one(args, "rmdir", fat16::Fat16::rmdir),
            "mv" => cmd_fs_two(args, "mv", fat16::Fat16::mv),
            "cp" => cmd_fs_two(args, "cp", fat16::Fat16::cp),
            "run" => cmd_run(args),
            unknown => println!("{unknown}: command not found (try 'help')"),
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("System:");
    println!("  help              Show this help menu");
    println!("  clear             Clear screen");
    println!("  about             About Opal OS");
    println!("  version           Show OS version");
    println!("  uname             Kernel information");
    println!("  uptime            Show system uptime");
    println!("  sleep <sec>       Sleep for N seconds");
    println!("  halt              Halt the CPU");
    println!("  reboot            Reboot the system");
    println!();
    println!("Shell:");
    println!("  history           Show command history");
    println!("  echo <text>       Print text");
    println!();
    println!("Disk:");
    println!("  diskread          Dump the start of sector 0");
    println!("  disktest          Write + read a scratch sector");
    println!("  fatinfo           Show FAT16 boot sector info");
    println!();
    println!("Filesystem (FAT16):");
    println!("  ls [path]         List directory");
    println!("  pwd               Print working directory");
    println!("  cd <path>         Change directory");
    println!("  touch <path>      Create empty file");
    println!("  mkdir [-p] <path> Create directory (or full path)");
    println!("  cat <path>        Print file contents");
    println!("  write <p> <text>  Replace file with text");
    println!("  append <p> <text> Append text to file");
    println!("  rm [-r] <path>    Delete file (or tree)");
    println!("  rmdir <path>      Delete empty directory");
    println!("  mv <src> <dst>    Move / rename");
    println!("  cp <src> <dst>    Copy file");
    println!();
    println!("Programs:");
    println!("  run <path> [args] Execute an ELF program");
}

fn cmd_sleep(args: &[&str]) {
    match args.get(1).and_then(|raw| raw.parse::<u32>().ok()) {
        Some(seconds) => timer::sleep(seconds),
        None => println!("usage: sleep <seconds>"),
    }
}

fn cmd_diskread() {
    let mut disk = AtaDisk::primary();
    let mut sector = [0_u8; SECTOR_SIZE];
    disk.read_sector(0, &mut sector);

    for (index, byte) in sector.iter().take(64).enumerate() {
        if index % 16 == 0 {
            print!("\n{index:04x}: ");
        }
        print!("{byte:02x} ");
    }
    println!();
}

/// Round-trip a pattern through the last sector of the volume, restoring
/// the original content afterwards.
fn cmd_disktest() {
    let Ok(total) = fat16::with_fs(|fs| Ok(fs.bpb().total_sectors())) else {
        println!("disktest: no volume mounted");
        return;
    };
    let lba = total - 1;

    let mut disk = AtaDisk::primary();
    let mut original = [0_u8; SECTOR_SIZE];
    disk.read_sector(lba, &mut original);

    let mut pattern = [0_u8; SECTOR_SIZE];
    for (index, byte) in pattern.iter_mut().enumerate() {
        *byte = (index % 251) as u8;
    }
    disk.write_sector(lba, &pattern);

    let mut readback = [0_u8; SECTOR_SIZE];
    disk.read_sector(lba, &mut readback);
    disk.write_sector(lba, &original);

    if readback == pattern {
        println!("disktest: sector {lba} ok");
    } else {
        println!("disktest: MISMATCH on sector {lba}");
    }
}

fn cmd_fatinfo() {
    let outcome = fat16::with_fs(|fs| Ok(*fs.bpb()));
    match outcome {
        Ok(bpb) => {
            println!("bytes/sector:      {}", bpb.bytes_per_sector);
            println!("sectors/cluster:   {}", bpb.sectors_per_cluster);
            println!("reserved sectors:  {}", bpb.reserved_sectors);
            println!("FAT copies:        {}", bpb.num_fats);
            println!("sectors/FAT:       {}", bpb.sectors_per_fat);
            println!("root entries:      {}", bpb.root_entries);
            println!("total sectors:     {}", bpb.total_sectors());
            println!("first data sector: {}", bpb.first_data_sector());
        }
        Err(err) => println!("fatinfo: {err}"),
    }
}

fn cmd_ls(args: &[&str]) {
    let path = args.get(1).copied().unwrap_or(".");
    match fat16::with_fs(|fs| fs.list_names(path)) {
        Ok(names) => {
            for entry_name in names {
                println!("{entry_name}");
            }
        }
        Err(err) => println!("ls: {err}"),
    }
}

fn cmd_mkdir(args: &[&str]) {
    match args {
        [_, "-p", path] => report("mkdir", fat16::with_fs(|fs| fs.mkdir_p(path))),
        [_, path] => report("mkdir", fat16::with_fs(|fs| fs.mkdir(path))),
        _ => println!("usage: mkdir [-p] <path>"),
    }
}

fn cmd_cat(args: &[&str]) {
    let Some(path) = args.get(1) else {
        println!("usage: cat <path>");
        return;
    };
    match fat16::with_fs(|fs| fs.read_file(path)) {
        Ok(data) => {
            for chunk in data.utf8_chunks() {
                print!("{}", chunk.valid());
                if !chunk.invalid().is_empty() {
                    print!(".");
                }
            }
            println!();
        }
        Err(err) => println!("cat: {err}"),
    }
}

fn cmd_write(args: &[&str], append: bool) {
    let verb = if append { "append" } else { "write" };
    if args.len() < 3 {
        println!("usage: {verb} <path> <text>");
        return;
    }
    let path = args[1];
    let mut text = String::new();
    for (index, word) in args[2..].iter().enumerate() {
        if index > 0 {
            text.push(' ');
        }
        text.push_str(word);
    }
    text.push('\n');

    let outcome = if append {
        fat16::with_fs(|fs| {
            if fs.exists(path) {
                fs.append_file(path, text.as_bytes())
            } else {
                fs.write_file(path, text.as_bytes())
            }
        })
    } else {
        fat16::with_fs(|fs| fs.write_file(path, text.as_bytes()))
    };
    report(verb, outcome);
}

fn cmd_rm(args: &[&str]) {
    match args {
        [_, "-r", path] => report("rm", fat16::with_fs(|fs| fs.rm_rf(path))),
        [_, path] => report("rm", fat16::with_fs(|fs| fs.rm(path))),
        _ => println!("usage: rm [-r] <path>"),
    }
}

fn cmd_run(args: &[&str]) {
    let Some(path) = args.get(1) else {
        println!("usage: run <path> [args]");
        return;
    };
    match userspace::exec_argv(path, &args[1..]) {
        Ok(code) => println!("[{path}] exited with code {code}"),
        Err(err) => println!("run: {err}"),
    }
}

fn cmd_fs_one(
    args: &[&str],
    verb: &str,
    op: impl Fn(&mut fat16::Fat16<alloc::boxed::Box<dyn BlockDevice + Send>>, &str) -> fat16::Result<()>,
) {
    match args {
        [_, path] => report(verb, fat16::with_fs(|fs| op(fs, path))),
        _ => println!("usage: {verb} <path>"),
    }
}

fn cmd_fs_two(
    args: &[&str],
    verb: &str,
    op: impl Fn(
        &mut fat16::Fat16<alloc::boxed::Box<dyn BlockDevice + Send>>,
        &str,
        &str,
    ) -> fat16::Result<()>,
) {
    match args {
        [_, a, b] => report(verb, fat16::with_fs(|fs| op(fs, a, b))),
        _ => println!("usage: {verb} <src> <dst>"),
    }
}

fn report(verb: &str, outcome: fat16::Result<()>) {
    match outcome {
        Ok(()) => {}
        Err(Fat16Error::AlreadyExists) => println!("{verb}: destination exists"),
        Err(err) => println!("{verb}: {err}"),
    }
}
