//! Remote agent command lines.

/// Path of the helper binary inside a dev container.
pub const CONTAINER_HELPER_PATH: &str = "/usr/local/bin/devpod";

/// Single-quote `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Starts the secure-shell server role on the host over stdio.
pub fn helper_ssh_server(agent: &str, debug: bool) -> String {
    let mut command = format!("{} helper ssh-server --stdio", quote(agent));
    if debug {
        command.push_str(" --debug");
    }
    command
}

/// Bridges the host session to the container's secure-shell server.
pub fn container_tunnel(agent: &str, workspace_info: &str, debug: bool) -> String {
    let mut command = format!(
        "{} agent container-tunnel --workspace-info {}",
        quote(agent),
        quote(workspace_info)
    );
    if debug {
        command.push_str(" --debug");
    }
    command
}

/// Pushes refreshed workspace configuration to the host agent.
pub fn update_config(agent: &str, workspace_info: &str, agent_dir: Option<&str>) -> String {
    let mut command = format!(
        "{} agent workspace update-config --workspace-info {}",
        quote(agent),
        quote(workspace_info)
    );
    if let Some(dir) = agent_dir.filter(|d| !d.is_empty()) {
        command.push_str(&format!(" --agent-dir {}", quote(dir)));
    }
    command
}

/// Flags for the in-container credentials server.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialsServerFlags {
    pub configure_git_helper: bool,
    pub configure_docker_helper: bool,
    pub forward_ports: bool,
    pub debug: bool,
}

pub fn credentials_server(helper: &str, user: &str, flags: CredentialsServerFlags) -> String {
    let mut command = format!(
        "{} agent container credentials-server --user {}",
        quote(helper),
        quote(user)
    );
    if flags.configure_git_helper {
        command.push_str(" --configure-git-helper");
    }
    if flags.configure_docker_helper {
        command.push_str(" --configure-docker-helper");
    }
    if flags.forward_ports {
        command.push_str(" --forward-ports");
    }
    if flags.debug {
        command.push_str(" --debug");
    }
    command
}
