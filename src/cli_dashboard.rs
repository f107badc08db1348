//! Overview (stream length and consumers)
//! Pending (entries delivered but not yet acknowledged)
//! Tasks (latest submissions and their status)

use std::{
  error::Error,
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use chrono::Local;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use docsum::{
  config::Config,
  errors::BrokerError,
  messaging::{PendingEntry, RedisWorkLog, create_redis_connection},
  models::StatusSnapshot,
  status_store::{RedisStore, StatusStore},
};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

const RECENT_TASKS: usize = 20;
const PENDING_ROWS: usize = 50;

struct ConsumerInfo {
  name: String,
  pending: usize,
  idle: Duration,
}

struct TaskRow {
  entry_id: String,
  task_id: String,
  state: String,
  progress: String,
  message: String,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Pending,
  Tasks,
}

struct App {
  current_tab: DashboardTab,
  stream: String,
  stream_length: usize,
  consumers: Vec<ConsumerInfo>,
  pending: Vec<PendingEntry>,
  tasks: Vec<TaskRow>,
  refreshed_at: String,
  error: Option<String>,
}

impl App {
  fn new(stream: &str) -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      stream: stream.to_string(),
      stream_length: 0,
      consumers: vec![],
      pending: vec![],
      tasks: vec![],
      refreshed_at: "never".into(),
      error: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Pending,
      DashboardTab::Pending => DashboardTab::Tasks,
      DashboardTab::Tasks => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Tasks,
      DashboardTab::Pending => DashboardTab::Overview,
      DashboardTab::Tasks => DashboardTab::Pending,
    }
  }

  /// Keep the selected tab across refreshes.
  fn replace(&mut self, mut fresh: App) {
    fresh.current_tab = self.current_tab;
    *self = fresh;
  }
}

fn task_row(entry_id: String, task_id: String, snapshot: Option<StatusSnapshot>) -> TaskRow {
  let (state, progress, message) = match snapshot {
    None => ("EXPIRED".to_string(), "-".to_string(), "Status not found or expired".to_string()),
    Some(snapshot) => {
      let progress = match &snapshot {
        StatusSnapshot::Pending { total, current, .. } | StatusSnapshot::Processing { total, current, .. } => {
          format!("{}/{}", current, total)
        }
        StatusSnapshot::Success { processed, failed, total, .. } => format!("{} ok, {} failed of {}", processed, failed, total),
        StatusSnapshot::Failure { .. } => "-".into(),
      };
      (snapshot.state().to_string(), progress, snapshot.message().to_string())
    }
  };
  TaskRow {
    entry_id,
    task_id,
    state,
    progress,
    message,
  }
}

async fn fetch_state(log: &RedisWorkLog, status: &StatusStore) -> Result<App, BrokerError> {
  let mut app = App::new(log.stream());
  app.stream_length = log.length().await?;
  // The group does not exist until the first worker starts.
  app.consumers = log
    .consumers()
    .await
    .unwrap_or_default()
    .into_iter()
    .map(|(name, pending, idle)| ConsumerInfo { name, pending, idle })
    .collect();
  app.pending = log.pending(PENDING_ROWS).await.unwrap_or_default();

  for delivery in log.recent(RECENT_TASKS).await? {
    let task_id = delivery.fields.get("task_id").cloned().unwrap_or_else(|| "N/A".into());
    let row = match status.get(&task_id).await {
      Ok(snapshot) => task_row(delivery.entry_id, task_id, snapshot),
      Err(BrokerError::CorruptRecord { reason, .. }) => TaskRow {
        entry_id: delivery.entry_id,
        task_id,
        state: "CORRUPT".into(),
        progress: "-".into(),
        message: reason,
      },
      Err(e) => return Err(e),
    };
    app.tasks.push(row);
  }
  app.refreshed_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
  Ok(app)
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env();
  let rt = Runtime::new()?;
  let conn = rt.block_on(create_redis_connection(&config.redis_url))?;
  let log = Arc::new(RedisWorkLog::new(conn.clone(), &config.stream_name, &config.consumer_group));
  let status = Arc::new(StatusStore::new(Arc::new(RedisStore::new(conn)), config.task_expiration));

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = std::sync::mpsc::channel::<App>();
  {
    let log = log.clone();
    let status = status.clone();
    thread::spawn(move || {
      loop {
        let app_state = rt.block_on(fetch_state(&log, &status)).unwrap_or_else(|e| {
          let mut app = App::new(log.stream());
          app.error = Some(e.to_string());
          app.refreshed_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
          app
        });
        if tx.send(app_state).is_err() {
          break;
        }
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  let mut app = App::new(&config.stream_name);
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(new_state) = rx.try_recv() {
      app.replace(new_state);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or(Duration::ZERO);
    if event::poll(timeout)?
      && let CEvent::Key(key) = event::read()?
    {
      match key.code {
        KeyCode::Char('q') => break,
        KeyCode::Right | KeyCode::Tab => app.next_tab(),
        KeyCode::Left => app.previous_tab(),
        _ => {}
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Overview", "Pending", "Tasks"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title(format!("docsum: {}", app.stream)))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Overview => 0,
    DashboardTab::Pending => 1,
    DashboardTab::Tasks => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Pending => render_pending(f, app, chunks[1]),
    DashboardTab::Tasks => render_tasks(f, app, chunks[1]),
  }

  let footer_text = match &app.error {
    Some(e) => format!("Refresh failed at {}: {} | q: Quit", app.refreshed_at, e),
    None => format!("Updated {} | ←/→: Switch Tabs | q: Quit", app.refreshed_at),
  };
  let footer_color = if app.error.is_some() { Color::Red } else { Color::White };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(footer_color))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
    .split(area);

  let total_pending: usize = app.consumers.iter().map(|c| c.pending).sum();
  let summary = vec![
    ListItem::new(Spans::from(Span::raw(format!("Entries in stream: {}", app.stream_length)))),
    ListItem::new(Spans::from(Span::raw(format!("Unacknowledged: {}", total_pending)))),
    ListItem::new(Spans::from(Span::raw(format!("Consumers: {}", app.consumers.len())))),
  ];
  let summary_list = List::new(summary).block(Block::default().borders(Borders::ALL).title("Work Log"));
  f.render_widget(summary_list, chunks[0]);

  let consumer_items: Vec<ListItem> = app
    .consumers
    .iter()
    .map(|c| {
      let lines = vec![
        Spans::from(Span::styled(c.name.clone(), Style::default().add_modifier(Modifier::BOLD))),
        Spans::from(Span::raw(format!("Pending: {} | Idle: {}s", c.pending, c.idle.as_secs()))),
      ];
      ListItem::new(lines)
    })
    .collect();
  let consumers_list = List::new(if consumer_items.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No consumers registered")))]
  } else {
    consumer_items
  })
  .block(Block::default().borders(Borders::ALL).title("Consumers"));
  f.render_widget(consumers_list, chunks[1]);
}

fn render_pending<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .pending
    .iter()
    .map(|p| {
      let color = if p.times_delivered > 1 { Color::Red } else { Color::Yellow };
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{} ", p.entry_id), Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::raw(format!(
          "Consumer: {} | Idle: {}s | Deliveries: {}",
          p.consumer,
          p.idle.as_secs(),
          p.times_delivered
        )),
      ]))
    })
    .collect();
  let title = format!("Unacknowledged Entries ({})", app.pending.len());
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
  f.render_widget(list, area);
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .tasks
    .iter()
    .map(|t| {
      let color = match t.state.as_str() {
        "SUCCESS" => Color::Green,
        "FAILURE" => Color::Red,
        "PROCESSING" => Color::Cyan,
        _ => Color::Gray,
      };
      ListItem::new(vec![
        Spans::from(vec![
          Span::styled(format!("{:<10} ", t.state), Style::default().fg(color).add_modifier(Modifier::BOLD)),
          Span::raw(format!("{} ({})", t.task_id, t.entry_id)),
        ]),
        Spans::from(Span::raw(format!("  {} | {}", t.progress, t.message))),
      ])
    })
    .collect();
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Recent Tasks"));
  f.render_widget(list, area);
}
