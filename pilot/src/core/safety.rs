//! Destructive shell command detection.

use std::sync::LazyLock;

use regex::RegexSet;

static DESTRUCTIVE: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // file destruction
        r"(?i)\brm\s+(-[a-z]*[rf][a-z]*|--recursive|--force)",
        r"(?i)\brmdir\b",
        r":\s*>\s*/",
        r"(?i)\bmv\s+.*/dev/null",
        r"(?i)\bfind\s+.*-delete",
        r"(?i)\bfind\s+.*-exec\s+rm",
        r"(?i)\bxargs\s+rm",
        // git
        r"(?i)\bgit\s+push\s+.*(--force|-f\b)",
        r"(?i)\bgit\s+reset\s+--hard",
        r"(?i)\bgit\s+clean\s+-[dfx]+",
        // databases
        r"(?i)\bDROP\s+(TABLE|DATABASE|INDEX)",
        r"(?i)\bDELETE\s+FROM",
        r"(?i)\bTRUNCATE\s+TABLE",
        // disks and system control
        r"(?i)\bmkfs\.",
        r"(?i)\bdd\s+if=",
        r">\s*/dev/(sd|nvme|disk)",
        r"(?i)\bchmod\s+(-R\s+)?(000|777)",
        r"(?i)\b(reboot|shutdown|halt)\b",
        r"(?i)\bkillall\s+",
        r"(?i)\bpkill\s+-9\s+",
        r"(?i)\bcrontab\s+-r",
        // remote code and shell escapes
        r"(?i)\b(curl|wget)\s+.*\|\s*(bash|sh|zsh)",
        r"(?i)\|\s*(bash|sh|zsh|python3?)\b",
        r"(?i)base64\s+.*-d.*\|\s*(bash|sh)",
        r"(?i)python3?.*-c.*(subprocess|os\.(system|remove|unlink|rmdir))",
        r"`[^`]*\brm\s",
        r"\$\([^)]*\brm\s",
        r";\s*(rm|curl|wget|dd|mkfs|shutdown|reboot)\b",
        r":\(\)\s*\{\s*:\|",
    ])
    .unwrap()
});

/// Whether a shell command looks destructive or escapes the sandbox.
pub fn is_destructive(command: &str) -> bool {
    DESTRUCTIVE.is_match(command)
}
