//! Integration tests.  Runs the shk binary against a temp directory.

fn shk_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("shk")
}

fn shk_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(shk_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Use print! so the Rust test framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

fn assert_output_contains(out: &std::process::Output, text: &str) {
    let stdout = std::str::from_utf8(&out.stdout).unwrap();
    if !stdout.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

/// Manages a temporary directory for invoking shk.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but print output and fail on a non-zero exit.
    fn run_expect(&self, cmd: &mut std::process::Command) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }
}

const TOUCH_RULE: &str = "
rule touch
  command = touch $out
  description = touch $out
";

#[test]
fn basic_build_then_no_work() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut shk_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert!(space.exists("out"));

    // A second build finds nothing to do.
    let out = space.run_expect(&mut shk_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn chained_steps_build_in_order() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule append
  command = cat $in > $out && echo $out >> $out

build mid: append in
build end: append mid
",
    )?;
    space.write("in", "start\n")?;
    space.run_expect(&mut shk_command(vec!["end"]))?;
    let end = String::from_utf8(space.read("end")?)?;
    assert!(end.contains("start"));
    assert!(end.contains("mid"));
    Ok(())
}

#[test]
fn content_change_triggers_rebuild_but_touch_does_not() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule copy
  command = cp $in $out

build out: copy in
",
    )?;
    space.write("in", "one")?;
    space.run_expect(&mut shk_command(vec!["out"]))?;
    assert_eq!(space.read("out")?, b"one");

    // Rewriting identical content does not re-run the copy.
    space.write("in", "one")?;
    let out = space.run_expect(&mut shk_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    // Changing the content does.
    space.write("in", "two")?;
    let out = space.run_expect(&mut shk_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"two");
    Ok(())
}

#[test]
fn failing_command_fails_the_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule fail
  command = false

build out: fail in
",
    )?;
    space.write("in", "")?;
    let out = space.run(&mut shk_command(vec!["out"]))?;
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}

#[test]
fn unknown_target_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch", ""].join("\n"),
    )?;
    let out = space.run(&mut shk_command(vec!["nonsense"]))?;
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("unknown target"), "stderr: {}", stderr);
    Ok(())
}

#[test]
fn dry_run_touches_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut shk_command(vec!["-n", "out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert!(!space.exists("out"));
    assert!(!space.exists(".shk_log"));

    // The real build still has everything to do.
    space.run_expect(&mut shk_command(vec!["out"]))?;
    assert!(space.exists("out"));
    Ok(())
}

#[test]
fn outputs_in_subdirs_and_clean() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build sub/dir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut shk_command(vec!["sub/dir/out"]))?;
    assert!(space.exists("sub/dir/out"));

    let out = space.run_expect(&mut shk_command(vec!["-t", "clean"]))?;
    assert_output_contains(&out, "removed 1 file");
    assert!(!space.exists("sub/dir/out"));
    assert!(!space.exists("sub"));

    // After cleaning, the build runs again.
    let out = space.run_expect(&mut shk_command(vec!["sub/dir/out"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}

#[test]
fn clean_with_targets_leaves_the_rest_alone() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build a: touch", "build b: touch", ""].join("\n"),
    )?;
    space.run_expect(&mut shk_command(vec!["a", "b"]))?;
    assert!(space.exists("a"));
    assert!(space.exists("b"));

    // Cleaning one target must not touch the other.
    let out = space.run_expect(&mut shk_command(vec!["-t", "clean", "a"]))?;
    assert_output_contains(&out, "removed 1 file");
    assert!(!space.exists("a"));
    assert!(space.exists("b"));

    // Only the cleaned target has work to do.
    let out = space.run_expect(&mut shk_command(vec!["a", "b"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}

#[test]
fn builddir_holds_the_log() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "builddir = out",
            TOUCH_RULE,
            "build out/target: touch in",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut shk_command(vec!["out/target"]))?;
    assert!(space.exists("out/.shk_log"));
    assert!(!space.exists(".shk_log"));
    Ok(())
}

#[test]
fn default_targets_are_used() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch",
            "build b: touch",
            "default a",
            "",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut shk_command(vec![]))?;
    assert!(space.exists("a"));
    assert!(!space.exists("b"));
    Ok(())
}

#[test]
fn tool_list_and_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;

    let out = space.run(&mut shk_command(vec!["-t", "list"]))?;
    assert_output_contains(&out, "clean");
    assert_output_contains(&out, "recompact");

    let out = space.run_expect(&mut shk_command(vec!["-t", "commands", "out"]))?;
    assert_output_contains(&out, "touch out");
    Ok(())
}

#[test]
fn corrupt_log_recovers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut shk_command(vec!["out"]))?;

    // Tack a half-written record onto the log, as a crash would.
    let mut log = space.read(".shk_log")?;
    log.extend_from_slice(&[0xff, 0xff, 0xff]);
    std::fs::write(space.dir.path().join(".shk_log"), &log)?;

    // The next build warns, truncates, and still has nothing to rebuild.
    let out = space.run_expect(&mut shk_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}
