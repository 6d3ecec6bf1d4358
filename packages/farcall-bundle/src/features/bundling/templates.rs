//! Python fragments emitted into every bundle
//!
//! All helper names carry a `_farcall_` / `_FARCALL_` prefix so they cannot
//! clash with work-unit symbols.

/// Manifest loading and captured-state injection
pub const PREAMBLE_HEADER: &str = r#"# Generated by farcall. Do not edit.
import builtins as _farcall_builtins
import json as _farcall_json
import os as _farcall_os
import sys as _farcall_sys

_FARCALL_DIR = _farcall_os.path.dirname(_farcall_os.path.abspath(__file__))
_FARCALL_MANIFEST_PATH = _farcall_os.environ.get("FARCALL_MANIFEST") or _farcall_os.path.join(
    _FARCALL_DIR, "manifest.json"
)
with _farcall_builtins.open(_FARCALL_MANIFEST_PATH, "r", encoding="utf-8") as _farcall_fh:
    _FARCALL_MANIFEST = _farcall_json.load(_farcall_fh)
_farcall_os.environ.setdefault("FARCALL_DATA_DIR", _farcall_os.path.join(_FARCALL_DIR, "data"))
globals().update(_FARCALL_MANIFEST.get("captured_state", {}))
"#;

/// Filesystem shim with the same six operations and glob rules as the
/// Rust `Filesystem` implementations
pub const FILESYSTEM_SHIM: &str = r#"import re as _farcall_re
import stat as _farcall_stat
from datetime import datetime as _farcall_datetime, timezone as _farcall_timezone


class _FarcallFs:
    """list / find / stat / exists / disk_usage / count_files"""

    @staticmethod
    def _expand(path):
        return _farcall_os.path.expanduser(str(path))

    @staticmethod
    def _compile(pattern):
        out, i = [], 0
        while i < len(pattern):
            if pattern.startswith("**/", i):
                out.append("(?:.*/)?")
                i += 3
            elif pattern.startswith("**", i):
                out.append(".*")
                i += 2
            elif pattern[i] == "*":
                out.append("[^/]*")
                i += 1
            elif pattern[i] == "?":
                out.append("[^/]")
                i += 1
            else:
                out.append(_farcall_re.escape(pattern[i]))
                i += 1
        regex = _farcall_re.compile("^" + "".join(out) + "$")
        full_path = "/" in pattern

        def matches(relative):
            relative = relative.replace(_farcall_os.sep, "/")
            target = relative if full_path else relative.rsplit("/", 1)[-1]
            return regex.match(target) is not None

        return matches

    def _walk(self, root):
        root = self._expand(root)
        if not _farcall_os.path.exists(root):
            raise FileNotFoundError(root)
        for parent, dirs, files in _farcall_os.walk(root):
            dirs.sort()
            for name in sorted(dirs + files):
                full = _farcall_os.path.join(parent, name)
                yield full, _farcall_os.path.relpath(full, root), name in dirs

    def list(self, path):
        path = self._expand(path)
        entries = []
        for name in sorted(_farcall_os.listdir(path)):
            full = _farcall_os.path.join(path, name)
            info = _farcall_os.stat(full)
            entries.append(
                {
                    "name": name,
                    "path": full,
                    "is_dir": _farcall_stat.S_ISDIR(info.st_mode),
                    "size": info.st_size,
                }
            )
        return entries

    def find(self, root, pattern):
        matches = self._compile(pattern)
        return sorted(full for full, relative, _ in self._walk(root) if matches(relative))

    def stat(self, path):
        path = self._expand(path)
        info = _farcall_os.stat(path)
        modified = _farcall_datetime.fromtimestamp(info.st_mtime, _farcall_timezone.utc)
        return {
            "path": path,
            "size": info.st_size,
            "modified": modified.isoformat(),
            "permissions": _farcall_stat.S_IMODE(info.st_mode),
            "is_dir": _farcall_stat.S_ISDIR(info.st_mode),
        }

    def exists(self, path):
        return _farcall_os.path.exists(self._expand(path))

    def disk_usage(self, path):
        path = self._expand(path)
        if not _farcall_os.path.isdir(path):
            return {"total_bytes": _farcall_os.stat(path).st_size, "files": 1, "directories": 0}
        usage = {"total_bytes": 0, "files": 0, "directories": 0}
        for full, _, is_dir in self._walk(path):
            if is_dir:
                usage["directories"] += 1
            else:
                usage["files"] += 1
                usage["total_bytes"] += _farcall_os.stat(full).st_size
        return usage

    def count_files(self, path, pattern=None):
        matches = self._compile(pattern) if pattern else None
        return sum(
            1
            for _, relative, is_dir in self._walk(path)
            if not is_dir and (matches is None or matches(relative))
        )
"#;

/// Entry-point invocation and the result protocol
pub const BOOTSTRAP: &str = r#"def _farcall_write(path, data):
    partial = path + ".partial"
    with _farcall_builtins.open(partial, "w", encoding="utf-8") as fh:
        fh.write(data)
    _farcall_os.replace(partial, path)


def _farcall_main():
    import traceback as _farcall_traceback

    out_dir = _farcall_os.environ.get("FARCALL_OUTPUT_DIR") or _FARCALL_DIR
    _farcall_os.makedirs(out_dir, exist_ok=True)
    arguments = _FARCALL_MANIFEST.get("arguments", {})
    entry = globals()[_FARCALL_MANIFEST["entry_point"]]
    try:
        value = entry(*arguments.get("args", []), **arguments.get("kwargs", {}))
        try:
            payload = _farcall_json.dumps({"ok": True, "value": value})
        except (TypeError, ValueError):
            payload = _farcall_json.dumps({"ok": True, "value": repr(value)})
        status, sentinel = 0, "_SUCCESS"
    except Exception as exc:
        payload = _farcall_json.dumps(
            {
                "ok": False,
                "error": "%s: %s" % (type(exc).__name__, exc),
                "traceback": _farcall_traceback.format_exc(),
            }
        )
        status, sentinel = 1, "_FAILED"
    _farcall_write(_farcall_os.path.join(out_dir, "result.json"), payload)
    _farcall_builtins.open(_farcall_os.path.join(out_dir, sentinel), "w").close()
    print("__FARCALL_RESULT__ " + payload)
    _farcall_sys.stdout.flush()
    return status


if __name__ == "__main__":
    _farcall_sys.exit(_farcall_main())
"#;

/// Stdout marker preceding the result JSON
pub const RESULT_MARKER: &str = "__FARCALL_RESULT__";
