use sa_domain::config::{Config, ConfigSeverity};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("serialagent doctor");
    println!("==================\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_state_dir(config, &mut all_passed);
    check_ipc_socket_dir(config, &mut all_passed);
    check_whitelisted_bash_program(config, &mut all_passed);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    // A missing config file is not fatal: struct defaults plus owner
    // fields left empty will already be caught by config validation.
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

fn check_state_dir(config: &Config, all_passed: &mut bool) {
    let path = &config.paths.state_dir;
    let exists = path.exists();
    let writable = if exists {
        let probe = path.join(".serialagent_doctor_probe");
        let w = std::fs::write(&probe, b"probe").is_ok();
        let _ = std::fs::remove_file(&probe);
        w
    } else {
        std::fs::create_dir_all(path).is_ok()
    };

    let ok = writable;
    let detail = if ok {
        format!("{} (writable)", path.display())
    } else {
        format!("{} (not writable)", path.display())
    };

    print_check("State directory", ok, detail);
    if !ok {
        *all_passed = false;
    }
}

fn check_ipc_socket_dir(config: &Config, all_passed: &mut bool) {
    let socket_path = &config.ipc.socket_path;
    let parent_ok = socket_path.parent().map(|p| p.exists()).unwrap_or(false);

    print_check(
        "IPC socket directory",
        parent_ok,
        socket_path.display().to_string(),
    );
    if !parent_ok {
        *all_passed = false;
    }
}

fn check_whitelisted_bash_program(config: &Config, all_passed: &mut bool) {
    let program = &config.tier_policy.whitelisted_bash_program;
    let configured = !program.is_empty();

    print_check(
        "Whitelisted bash program configured",
        configured,
        if configured {
            program.clone()
        } else {
            "not configured".into()
        },
    );
    if !configured {
        *all_passed = false;
    }
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
