use assert_cmd::Command;

pub fn cadenced_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("cadenced").expect("cadenced test binary should build")
    }
}
