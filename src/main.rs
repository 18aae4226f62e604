fn main() -> coswitch::Result<()> {
    coswitch::demo::run(|line| println!("{line}"))
}
