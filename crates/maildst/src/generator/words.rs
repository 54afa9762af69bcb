pub(super) const FIRST_NAMES: &[&str] = &[
    "Alice", "Amir", "Ana", "Ben", "Carla", "Chen", "Dana", "David", "Elena", "Emeka", "Farah",
    "Felix", "Grace", "Hana", "Hugo", "Ines", "Ivan", "Jonas", "Julia", "Kai", "Keiko", "Lars",
    "Lena", "Liam", "Maya", "Mateo", "Nadia", "Nils", "Omar", "Olga", "Paul", "Priya", "Quinn",
    "Rosa", "Ravi", "Sara", "Sven", "Tara", "Tomas", "Uma", "Victor", "Wen", "Yara", "Zoe",
];

pub(super) const LAST_NAMES: &[&str] = &[
    "Adams", "Bauer", "Castro", "Dubois", "Eriksen", "Fischer", "Garcia", "Hoffmann", "Ito",
    "Jensen", "Kowalski", "Lopez", "Moreau", "Nakamura", "Novak", "Okafor", "Petrov", "Quint",
    "Rossi", "Santos", "Schmidt", "Tanaka", "Ueda", "Varga", "Weber", "Xu", "Young", "Zhang",
];

pub(super) const COMPANY_WORDS: &[&str] = &[
    "Acme", "Apex", "Blue", "Cedar", "Delta", "Ember", "Falcon", "Granite", "Harbor", "Iron",
    "Juniper", "Keystone", "Lumen", "Meridian", "Northwind", "Orbit", "Pioneer", "Quartz",
    "Summit", "Vertex",
];

pub(super) const COMPANY_SUFFIXES: &[&str] = &[
    "Inc", "LLC", "Group", "Labs", "Systems", "Partners", "and Sons", "Holdings",
];

pub(super) const DOMAINS: &[&str] = &[
    "example.com", "example.net", "example.org", "mail.test", "corp.test", "post.test",
];

pub(super) const WORDS: &[&str] = &[
    "account", "agenda", "approve", "budget", "call", "change", "check", "client", "contract",
    "data", "deadline", "deliver", "design", "draft", "estimate", "event", "feedback", "final",
    "follow", "forward", "goal", "help", "idea", "invoice", "issue", "item", "launch", "list",
    "meeting", "month", "move", "need", "next", "note", "office", "order", "plan", "point",
    "price", "project", "quarter", "question", "quick", "release", "report", "request", "review",
    "room", "schedule", "send", "share", "status", "step", "summary", "support", "task", "team",
    "think", "ticket", "time", "today", "update", "week", "work", "write", "year",
];
